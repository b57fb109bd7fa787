//! Pages of a file.

use super::slots::PageSlots;
use super::{Mapping, write_protect};
use crate::error::VmError;
use crate::inode::{Inode, IoError};
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_alloc::{Bitmap, FRAME_BYTES, FrameAllocator, FramePolicy, PhysMapper, PhysicalFrame};
use kernel_memory_addresses::{PAGE_SIZE, align_up};
use kernel_sync::{SpinLock, SpinLockGuard};
use kernel_vmem::Mmu;
use log::{debug, trace, warn};

/// Whether writes through one mapping reach the file and other mappings.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InodeSharing {
    /// Writes stay in this mapping's pages.
    Private,
    /// One object per inode; writes are visible everywhere and written back.
    Shared,
}

pub struct InodeObject {
    inode: Arc<dyn Inode>,
    sharing: InodeSharing,
    pages: usize,
    /// Taken before `state`.
    mappings: SpinLock<Vec<Mapping>>,
    state: SpinLock<InodePages>,
}

struct InodePages {
    slots: PageSlots,
    dirty: Bitmap,
}

impl InodeObject {
    pub(super) fn new(inode: Arc<dyn Inode>, sharing: InodeSharing) -> Result<Self, VmError> {
        let size = align_up(inode.size(), PAGE_SIZE);
        if size == 0 {
            return Err(VmError::InvalidRange);
        }
        let pages = usize::try_from(size / PAGE_SIZE).map_err(|_| VmError::InvalidRange)?;
        Ok(Self {
            inode,
            sharing,
            pages,
            mappings: SpinLock::new(Vec::new()),
            state: SpinLock::new(InodePages {
                slots: PageSlots::new(pages),
                dirty: Bitmap::new(pages, false),
            }),
        })
    }

    pub const fn inode(&self) -> &Arc<dyn Inode> {
        &self.inode
    }

    pub const fn sharing(&self) -> InodeSharing {
        self.sharing
    }

    pub(super) const fn page_count(&self) -> usize {
        self.pages
    }

    pub(super) fn frame(&self, index: usize) -> Option<PhysicalFrame> {
        self.state.lock().slots.get(index).cloned()
    }

    pub(super) fn resident_pages(&self) -> usize {
        self.state.lock().slots.resident()
    }

    pub(super) fn is_frame_shared(&self, index: usize) -> bool {
        self.state.lock().slots.is_frame_shared(index)
    }

    pub(super) fn lock_mappings(&self) -> SpinLockGuard<'_, Vec<Mapping>> {
        self.mappings.lock()
    }

    pub(super) fn page_in<M: PhysMapper>(
        &self,
        frames: &FrameAllocator,
        mapper: &M,
        index: usize,
    ) -> Result<PhysicalFrame, VmError> {
        if let Some(frame) = self.frame(index) {
            return Ok(frame);
        }

        // The read may sleep in the filesystem, so it runs unlocked.
        let frame = frames.allocate(FramePolicy::Any)?;
        let offset = page_offset(index);
        let read = frame.with_bytes(mapper, |bytes| {
            let read = self.inode.read_page(offset, bytes)?.min(FRAME_BYTES);
            bytes[read..].fill(0);
            Ok::<_, IoError>(read)
        })?;
        trace!("Read {read} bytes of inode {} at {offset:#x}", self.inode.id());

        Ok(self.state.lock().slots.install(index, frame))
    }

    pub(super) fn fork(&self) -> Self {
        let mut state = self.state.lock();
        let slots = state.slots.fork();
        let dirty = state.dirty.clone();
        Self {
            inode: Arc::clone(&self.inode),
            sharing: self.sharing,
            pages: self.pages,
            mappings: SpinLock::new(Vec::new()),
            state: SpinLock::new(InodePages { slots, dirty }),
        }
    }

    pub(super) fn should_cow(&self, index: usize) -> bool {
        self.state.lock().slots.should_cow(index)
    }

    pub(super) fn break_cow<M: PhysMapper>(
        &self,
        frames: &FrameAllocator,
        mapper: &M,
        index: usize,
    ) -> Result<PhysicalFrame, VmError> {
        Ok(self.state.lock().slots.break_cow(index, frames, mapper)?)
    }

    pub(super) fn mark_dirty(&self, index: usize) {
        self.state.lock().dirty.set(index, true);
    }

    pub(super) fn mark_clean<P: Mmu>(&self, platform: &P, index: usize) {
        let mappings = self.mappings.lock();
        let mut state = self.state.lock();
        write_protect(platform, &mappings, index);
        state.dirty.set(index, false);
    }

    pub(super) fn is_dirty(&self, index: usize) -> bool {
        self.state.lock().dirty.get(index)
    }

    pub(super) fn dirty_pages(&self) -> usize {
        self.state.lock().dirty.count_ones()
    }

    /// Writes every dirty page back to the inode.
    ///
    /// Each page is write-protected in every mapping and its bit cleared
    /// before the write, so a store during or after the write dirties it
    /// again. A failed page is marked dirty again; the loop carries on and
    /// the first error is returned. Pages the file no longer reaches are
    /// dropped clean.
    pub(super) fn flush<P: PhysMapper + Mmu>(&self, platform: &P) -> Result<usize, VmError> {
        if self.sharing == InodeSharing::Private {
            return Ok(0);
        }

        let pending: Vec<(usize, PhysicalFrame)> = {
            let mappings = self.mappings.lock();
            let mut state = self.state.lock();
            let pending: Vec<_> = state
                .dirty
                .iter_ones()
                .filter_map(|index| state.slots.get(index).map(|frame| (index, frame.clone())))
                .collect();
            for (index, _) in &pending {
                write_protect(platform, &mappings, *index);
                state.dirty.set(*index, false);
            }
            pending
        };

        let size = self.inode.size();
        let mut written = 0;
        let mut first_error = None;
        for (index, frame) in pending {
            let offset = page_offset(index);
            if offset >= size {
                debug!("Inode {} ends before dirty page {index}; not written", self.inode.id());
                continue;
            }
            let len = usize::try_from((size - offset).min(PAGE_SIZE)).unwrap_or(FRAME_BYTES);
            match frame.with_bytes(platform, |bytes| self.inode.write_page(offset, &bytes[..len])) {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!("Write-back of inode {} page {index} failed: {e}", self.inode.id());
                    self.mark_dirty(index);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(written),
        }
    }
}

const fn page_offset(index: usize) -> u64 {
    index as u64 * PAGE_SIZE
}
