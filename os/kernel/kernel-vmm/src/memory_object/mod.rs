//! Memory objects: the sources of the pages a region maps.
//!
//! ```text
//!   Region ──► Arc<MemoryObject> ──► slot[i] ──► PhysicalFrame ──► zone
//!   Region ─┘        (one per        (COW bit,      (refcounted)
//!                     mapping or      dirty bit)
//!                     per inode)
//! ```
//!
//! A memory object is shared through `Arc`. The strong count is the number
//! of regions (and transient users such as a fault in progress) holding it.
//! Frames are shared between objects after a fork; the frame's own count
//! decides whether a copy-on-write break has to copy.
//!
//! Anonymous and inode objects also keep a list of the [`Mapping`]s that map
//! them, and their page-table entries are only installed with that list
//! locked. Clearing a dirty bit write-protects the page in every mapping
//! first, so the next store faults and dirties the page again. A
//! copy-on-write break unmaps the old frame from every other mapping of the
//! object.

mod inode_pages;
mod slots;

pub use inode_pages::{InodeObject, InodeSharing};

use crate::error::VmError;
use crate::inode::Inode;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use kernel_alloc::{CommittedFrames, FrameAllocator, FramePolicy, PhysMapper, PhysicalFrame};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, VirtualRange};
use kernel_sync::{SpinLock, SpinLockGuard};
use kernel_vmem::{Mmu, PageTableRoot};
use slots::PageSlots;

/// How an anonymous object gets its pages.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum AllocationStrategy {
    /// Allocate on first touch. A fault may find memory exhausted.
    #[default]
    Lazy,
    /// Commit every page now and allocate on first touch. Faults on the
    /// object never run out of memory.
    Reserve,
    /// Allocate and zero every page now.
    AllocateNow,
}

/// A window of an object mapped through one page-table root.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Mapping {
    pub root: PageTableRoot,
    pub range: VirtualRange,
    /// Object page mapped at `range.base()`.
    pub first_index: usize,
}

impl Mapping {
    /// Where object page `index` appears in this mapping.
    fn address_of(&self, index: usize) -> Option<VirtualAddress> {
        let page = index.checked_sub(self.first_index)?;
        (page < self.range.page_count()).then(|| self.range.base() + page as u64 * PAGE_SIZE)
    }
}

/// Unmaps page `index` from every mapping that still points at a frame other
/// than `frame`.
pub(crate) fn unmap_stale<P: Mmu>(platform: &P, mappings: &[Mapping], index: usize, frame: PhysicalAddress) {
    for mapping in mappings {
        let Some(va) = mapping.address_of(index) else {
            continue;
        };
        if platform.translate(mapping.root, va).is_some_and(|t| t.frame != frame) {
            platform.unmap_page(mapping.root, va);
            platform.flush(mapping.root, VirtualRange::new(va, PAGE_SIZE));
        }
    }
}

/// Clears the writable bit of page `index` wherever it is mapped.
fn write_protect<P: Mmu>(platform: &P, mappings: &[Mapping], index: usize) {
    for mapping in mappings {
        let Some(va) = mapping.address_of(index) else {
            continue;
        };
        let Some(translation) = platform.translate(mapping.root, va) else {
            continue;
        };
        if translation.flags.writable() {
            platform.protect_page(mapping.root, va, translation.flags.with_writable(false));
            platform.flush(mapping.root, VirtualRange::new(va, PAGE_SIZE));
        }
    }
}

pub enum MemoryObject {
    /// Zero-filled on demand.
    Anonymous(AnonymousObject),
    /// Every page resident from creation, physically contiguous or wrapping
    /// memory the kernel does not own.
    Contiguous(ContiguousObject),
    /// Pages read from an inode on demand.
    Inode(InodeObject),
}

pub struct AnonymousObject {
    pages: usize,
    /// Taken before `state`.
    mappings: SpinLock<Vec<Mapping>>,
    state: SpinLock<AnonymousPages>,
}

struct AnonymousPages {
    slots: PageSlots,
    /// Pages promised to first touches, for [`AllocationStrategy::Reserve`].
    committed: Option<CommittedFrames>,
}

impl AnonymousObject {
    fn with_slots(pages: usize, slots: PageSlots, committed: Option<CommittedFrames>) -> Self {
        Self {
            pages,
            mappings: SpinLock::new(Vec::new()),
            state: SpinLock::new(AnonymousPages { slots, committed }),
        }
    }
}

pub struct ContiguousObject {
    frames: Box<[PhysicalFrame]>,
}

impl ContiguousObject {
    /// Physical address of the first page.
    #[must_use]
    pub fn base(&self) -> PhysicalAddress {
        self.frames[0].address()
    }
}

impl MemoryObject {
    /// Zero-filled memory allocated on first touch.
    ///
    /// # Errors
    /// [`VmError::InvalidRange`] for a zero or unaligned size.
    pub fn anonymous(size: u64) -> Result<Arc<Self>, VmError> {
        let pages = page_count_of(size)?;
        Ok(Arc::new(Self::Anonymous(AnonymousObject::with_slots(
            pages,
            PageSlots::new(pages),
            None,
        ))))
    }

    /// Zero-filled memory whose pages are committed or allocated up front.
    ///
    /// # Errors
    /// - [`VmError::InvalidRange`] for a zero or unaligned size.
    /// - [`VmError::OutOfMemory`] if the pages cannot be committed or
    ///   allocated. Nothing stays committed or allocated then.
    pub fn anonymous_with<M: PhysMapper>(
        frames: &FrameAllocator,
        mapper: &M,
        size: u64,
        strategy: AllocationStrategy,
    ) -> Result<Arc<Self>, VmError> {
        let pages = page_count_of(size)?;
        let mut slots = PageSlots::new(pages);
        let committed = match strategy {
            AllocationStrategy::Lazy => None,
            AllocationStrategy::Reserve => Some(frames.commit(pages)?),
            AllocationStrategy::AllocateNow => {
                for index in 0..pages {
                    slots.install(index, frames.allocate_zeroed(FramePolicy::Any, mapper)?);
                }
                None
            }
        };
        Ok(Arc::new(Self::Anonymous(AnonymousObject::with_slots(
            pages, slots, committed,
        ))))
    }

    /// Allocates `size` bytes of physically contiguous, zeroed memory.
    ///
    /// # Errors
    /// - [`VmError::InvalidRange`] for a zero or unaligned size.
    /// - [`VmError::OutOfMemory`] if no zone has a long enough run.
    pub fn contiguous<M: PhysMapper>(
        frames: &FrameAllocator,
        mapper: &M,
        size: u64,
        policy: FramePolicy,
    ) -> Result<Arc<Self>, VmError> {
        let pages = page_count_of(size)?;
        let frames = frames.allocate_contiguous(pages, policy)?;
        for frame in &frames {
            frame.zero(mapper);
        }
        Ok(Arc::new(Self::Contiguous(ContiguousObject {
            frames: frames.into_boxed_slice(),
        })))
    }

    /// Wraps `[base, base + size)` of memory the kernel does not allocate.
    /// Dropping the object leaves the memory alone.
    ///
    /// # Errors
    /// [`VmError::InvalidRange`] for an unaligned base or a zero or unaligned
    /// size.
    pub fn for_physical_range(base: PhysicalAddress, size: u64) -> Result<Arc<Self>, VmError> {
        if !base.is_page_aligned() {
            return Err(VmError::InvalidRange);
        }
        let pages = page_count_of(size)?;
        let frames = (0..pages as u64)
            .map(|i| PhysicalFrame::wrap_existing(base + i * PAGE_SIZE))
            .collect();
        Ok(Arc::new(Self::Contiguous(ContiguousObject { frames })))
    }

    /// An object over the whole file, its size rounded up to whole pages.
    ///
    /// Shared objects should come from [`Vmm::shared_inode_object`] so that
    /// every shared mapping of one inode uses the same object.
    ///
    /// # Errors
    /// [`VmError::InvalidRange`] for an empty file.
    ///
    /// [`Vmm::shared_inode_object`]: crate::Vmm::shared_inode_object
    pub fn inode_backed(inode: Arc<dyn Inode>, sharing: InodeSharing) -> Result<Arc<Self>, VmError> {
        Ok(Arc::new(Self::Inode(InodeObject::new(inode, sharing)?)))
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        match self {
            Self::Anonymous(object) => object.pages,
            Self::Contiguous(object) => object.frames.len(),
            Self::Inode(object) => object.page_count(),
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.page_count() as u64 * PAGE_SIZE
    }

    #[must_use]
    pub fn resident_pages(&self) -> usize {
        match self {
            Self::Anonymous(object) => object.state.lock().slots.resident(),
            Self::Contiguous(object) => object.frames.len(),
            Self::Inode(object) => object.resident_pages(),
        }
    }

    /// Whether every clone of a mapping sees the same pages.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        match self {
            Self::Anonymous(_) => false,
            Self::Contiguous(_) => true,
            Self::Inode(object) => object.sharing() == InodeSharing::Shared,
        }
    }

    #[must_use]
    pub fn as_inode(&self) -> Option<&InodeObject> {
        match self {
            Self::Inode(object) => Some(object),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_contiguous(&self) -> Option<&ContiguousObject> {
        match self {
            Self::Contiguous(object) => Some(object),
            _ => None,
        }
    }

    /// The resident frame of page `index`, if any.
    ///
    /// # Panics
    /// If `index` is outside the object.
    #[must_use]
    pub fn frame(&self, index: usize) -> Option<PhysicalFrame> {
        match self {
            Self::Anonymous(object) => object.state.lock().slots.get(index).cloned(),
            Self::Contiguous(object) => Some(object.frames[index].clone()),
            Self::Inode(object) => object.frame(index),
        }
    }

    /// Makes page `index` resident and returns its frame.
    ///
    /// # Errors
    /// - [`VmError::OutOfMemory`] if no frame is available.
    /// - [`VmError::Io`] if the inode read failed. The slot stays empty.
    ///
    /// # Panics
    /// If `index` is outside the object.
    pub fn page_in<M: PhysMapper>(
        &self,
        frames: &FrameAllocator,
        mapper: &M,
        index: usize,
    ) -> Result<PhysicalFrame, VmError> {
        assert!(index < self.page_count(), "page {index} outside object");
        match self {
            Self::Anonymous(object) => {
                let mut state = object.state.lock();
                if let Some(frame) = state.slots.get(index) {
                    return Ok(frame.clone());
                }
                let frame = match state.committed.as_mut() {
                    Some(committed) if committed.remaining() > 0 => {
                        let frame = committed.allocate(frames)?;
                        frame.zero(mapper);
                        frame
                    }
                    _ => frames.allocate_zeroed(FramePolicy::Any, mapper)?,
                };
                Ok(state.slots.install(index, frame))
            }
            Self::Contiguous(object) => Ok(object.frames[index].clone()),
            Self::Inode(object) => object.page_in(frames, mapper, index),
        }
    }

    /// The object a forked mapping of this one uses.
    ///
    /// Shared inode and contiguous objects are returned as is. Anonymous and
    /// private inode objects are copied: frames are shared and every resident
    /// page becomes copy-on-write on both sides. A copy starts without
    /// committed pages.
    #[must_use]
    pub fn try_clone(self: &Arc<Self>) -> Arc<Self> {
        match &**self {
            Self::Contiguous(_) => Arc::clone(self),
            Self::Inode(object) if object.sharing() == InodeSharing::Shared => Arc::clone(self),
            Self::Inode(object) => Arc::new(Self::Inode(object.fork())),
            Self::Anonymous(object) => Arc::new(Self::Anonymous(AnonymousObject::with_slots(
                object.pages,
                object.state.lock().slots.fork(),
                None,
            ))),
        }
    }

    #[must_use]
    pub fn should_cow(&self, index: usize) -> bool {
        match self {
            Self::Anonymous(object) => object.state.lock().slots.should_cow(index),
            Self::Contiguous(_) => false,
            Self::Inode(object) => object.should_cow(index),
        }
    }

    /// Resolves copy-on-write for page `index` and returns the frame this
    /// object now owns for it.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the copy could not be allocated.
    ///
    /// # Panics
    /// If the page is not resident.
    pub fn break_cow<M: PhysMapper>(
        &self,
        frames: &FrameAllocator,
        mapper: &M,
        index: usize,
    ) -> Result<PhysicalFrame, VmError> {
        match self {
            Self::Anonymous(object) => Ok(object.state.lock().slots.break_cow(index, frames, mapper)?),
            Self::Contiguous(object) => Ok(object.frames[index].clone()),
            Self::Inode(object) => object.break_cow(frames, mapper, index),
        }
    }

    /// Whether pages of this object start out write-protected so that the
    /// first write can be recorded.
    #[must_use]
    pub const fn tracks_dirty(&self) -> bool {
        matches!(self, Self::Inode(_))
    }

    /// Whether page `index` is resident and its frame also held elsewhere,
    /// e.g. by the other side of a fork.
    #[must_use]
    pub fn is_frame_shared(&self, index: usize) -> bool {
        match self {
            Self::Anonymous(object) => object.state.lock().slots.is_frame_shared(index),
            Self::Contiguous(object) => object.frames[index].ref_count() > 1,
            Self::Inode(object) => object.is_frame_shared(index),
        }
    }

    /// Pages still promised to this object by a commitment.
    #[must_use]
    pub fn committed_pages(&self) -> usize {
        match self {
            Self::Anonymous(object) => object
                .state
                .lock()
                .committed
                .as_ref()
                .map_or(0, CommittedFrames::remaining),
            _ => 0,
        }
    }

    pub fn mark_dirty(&self, index: usize) {
        if let Self::Inode(object) = self {
            object.mark_dirty(index);
        }
    }

    /// Clears the dirty bit of page `index` after write-protecting it in
    /// every mapping, so that the next store is seen.
    pub fn mark_clean<P: Mmu>(&self, platform: &P, index: usize) {
        if let Self::Inode(object) = self {
            object.mark_clean(platform, index);
        }
    }

    #[must_use]
    pub fn is_dirty(&self, index: usize) -> bool {
        self.as_inode().is_some_and(|object| object.is_dirty(index))
    }

    #[must_use]
    pub fn dirty_pages(&self) -> usize {
        self.as_inode().map_or(0, InodeObject::dirty_pages)
    }

    /// Writes dirty pages back to their inode, returning how many were
    /// written. Only shared inode objects write anything.
    ///
    /// Each page is write-protected in every mapping before its bit is
    /// cleared; a store after the flush dirties it again.
    ///
    /// # Errors
    /// The first [`VmError::Io`]; every other dirty page is still attempted.
    pub fn flush_dirty_pages<P: PhysMapper + Mmu>(&self, platform: &P) -> Result<usize, VmError> {
        self.as_inode().map_or(Ok(0), |object| object.flush(platform))
    }

    /// The mapping list page-table updates of this object synchronize on.
    /// `None` for contiguous objects, whose frames never move.
    pub(crate) fn lock_mappings(&self) -> Option<SpinLockGuard<'_, Vec<Mapping>>> {
        match self {
            Self::Anonymous(object) => Some(object.mappings.lock()),
            Self::Contiguous(_) => None,
            Self::Inode(object) => Some(object.lock_mappings()),
        }
    }

    /// Final flush of an object nobody else holds. The frames go back to
    /// their zones when `self` is dropped.
    pub(crate) fn release<P: PhysMapper + Mmu>(self, platform: &P) -> Result<(), VmError> {
        let flushed = self.flush_dirty_pages(platform);
        drop(self);
        flushed.map(|_| ())
    }
}

impl fmt::Debug for MemoryObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Anonymous(_) => "Anonymous",
            Self::Contiguous(_) => "Contiguous",
            Self::Inode(object) if object.sharing() == InodeSharing::Shared => "SharedInode",
            Self::Inode(_) => "PrivateInode",
        };
        f.debug_struct(kind)
            .field("pages", &self.page_count())
            .field("resident", &self.resident_pages())
            .finish()
    }
}

fn page_count_of(size: u64) -> Result<usize, VmError> {
    if size == 0 || !size.is_multiple_of(PAGE_SIZE) {
        return Err(VmError::InvalidRange);
    }
    usize::try_from(size / PAGE_SIZE).map_err(|_| VmError::InvalidRange)
}
