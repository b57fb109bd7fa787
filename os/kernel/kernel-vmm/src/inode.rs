//! The filesystem boundary.
//!
//! Inode-backed memory objects read pages in and write dirty pages back
//! through this trait. Retry and timeout policy belong to the filesystem.

pub type InodeId = u64;

/// A failed inode read or write.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("i/o error on inode {inode} at offset {offset:#x}")]
pub struct IoError {
    pub inode: InodeId,
    pub offset: u64,
}

pub trait Inode: Send + Sync {
    /// Identity used to share one memory object between all shared mappings
    /// of the same file.
    fn id(&self) -> InodeId;

    /// File size in bytes.
    fn size(&self) -> u64;

    /// Reads up to `buf.len()` bytes at `offset`, returning how many were
    /// read. Short reads happen at end of file.
    ///
    /// # Errors
    /// [`IoError`] if the filesystem could not read.
    fn read_page(&self, offset: u64, buf: &mut [u8]) -> Result<usize, IoError>;

    /// Writes `data` at `offset`.
    ///
    /// # Errors
    /// [`IoError`] if the filesystem could not write.
    fn write_page(&self, offset: u64, data: &[u8]) -> Result<(), IoError>;
}
