//! The page-table seam.
//!
//! The memory core decides *what* is mapped where and with which rights; an
//! [`Mmu`] implementation knows *how* a particular architecture encodes that
//! in its page tables. Intermediate tables are allocated from the
//! [`FrameAllocator`] passed in.
//!
//! A leaf is installed once with [`Mmu::map_page`]; later permission changes
//! go through [`Mmu::protect_page`], which keeps the frame.

use bitfield_struct::bitfield;
use core::fmt;
use kernel_alloc::{FrameAllocator, OutOfMemory};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, VirtualRange};

/// Handle of one page-table hierarchy: the physical address of its top-level
/// table.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageTableRoot(PhysicalAddress);

impl PageTableRoot {
    #[inline]
    #[must_use]
    pub const fn new(table: PhysicalAddress) -> Self {
        Self(table)
    }

    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        self.0
    }
}

impl fmt::Debug for PageTableRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Root({})", self.0)
    }
}

/// Architecture-neutral leaf permissions.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct PteFlags {
    pub present: bool,
    pub writable: bool,
    /// Accessible from user mode.
    pub user: bool,
    pub executable: bool,
    #[bits(4)]
    __: u8,
}

/// Why a page could not be mapped.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("no frame left for an intermediate page table")]
    OutOfMemory,
    #[error("{0} already has a leaf entry")]
    AlreadyMapped(VirtualAddress),
}

impl From<OutOfMemory> for MapError {
    fn from(_: OutOfMemory) -> Self {
        Self::OutOfMemory
    }
}

/// A leaf mapping as read back from the page tables.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Translation {
    pub frame: PhysicalAddress,
    pub flags: PteFlags,
}

pub trait Mmu {
    /// Creates an empty hierarchy that already contains the shared kernel
    /// half.
    ///
    /// # Errors
    /// [`OutOfMemory`] if no frame is left for the top-level table.
    fn create_root(&self, frames: &FrameAllocator) -> Result<PageTableRoot, OutOfMemory>;

    /// Frees the user part of a hierarchy. The root must not be active.
    fn destroy_root(&self, root: PageTableRoot);

    /// Maps the 4 KiB page at `va` to `frame`.
    ///
    /// # Errors
    /// - [`MapError::AlreadyMapped`] if `va` has a leaf; it is left as is.
    /// - [`MapError::OutOfMemory`] if an intermediate table could not be
    ///   allocated.
    fn map_page(
        &self,
        frames: &FrameAllocator,
        root: PageTableRoot,
        va: VirtualAddress,
        frame: PhysicalAddress,
        flags: PteFlags,
    ) -> Result<(), MapError>;

    /// Replaces the flags of the leaf for `va`, keeping its frame. Returns
    /// the previous translation, or `None` if `va` is not mapped.
    ///
    /// The caller flushes the TLB.
    fn protect_page(&self, root: PageTableRoot, va: VirtualAddress, flags: PteFlags) -> Option<Translation>;

    /// Removes the leaf for `va`, returning the frame it pointed to.
    fn unmap_page(&self, root: PageTableRoot, va: VirtualAddress) -> Option<PhysicalAddress>;

    fn translate(&self, root: PageTableRoot, va: VirtualAddress) -> Option<Translation>;

    /// Invalidates cached translations for `range` on every processor that
    /// may have `root` loaded.
    fn flush(&self, root: PageTableRoot, range: VirtualRange);
}
