//! Regions: page-aligned virtual ranges backed by a window of a memory
//! object.
//!
//! A region decides what its page-table entries look like. A page is mapped
//! writable only when the region is writable, the page is not
//! copy-on-write, and (for inode objects) the page is already dirty. Every
//! other write traps, which is how copy-on-write and dirty tracking see it.
//!
//! Entries are installed with the object's mapping list locked, and a region
//! is on that list from [`Region::map_all`] until [`Region::unmap`].

use crate::error::VmError;
use crate::memory_object::{InodeSharing, Mapping, MemoryObject, unmap_stale};
use crate::vmm::{Platform, Vmm};
use alloc::sync::Arc;
use bitfield_struct::bitfield;
use core::fmt;
use kernel_alloc::{PhysMapper, PhysicalFrame};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, VirtualRange};
use kernel_vmem::{FaultAccess, FaultKind, Mmu, PageFault, PageTableRoot, PteFlags};
use log::{debug, trace};

/// What a region permits.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    /// Writes are visible to every mapping of the object.
    pub shared: bool,
    #[bits(4)]
    __: u8,
}

impl Access {
    pub const READ: Self = Self::new().with_read(true);
    pub const READ_WRITE: Self = Self::READ.with_write(true);
    pub const READ_EXECUTE: Self = Self::READ.with_execute(true);

    #[must_use]
    pub const fn permits(self, access: FaultAccess) -> bool {
        match access {
            FaultAccess::Read => self.read(),
            FaultAccess::Write => self.write(),
            FaultAccess::Execute => self.execute(),
        }
    }
}

/// Outcome of a handled page fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageFaultResponse {
    /// The access can be retried.
    Resolved,
    /// The access is not allowed; the faulting context gets a segfault.
    SignalSegfault,
}

/// The object page behind a virtual address.
#[derive(Debug, Clone)]
pub struct ObjectPage {
    pub object: Arc<MemoryObject>,
    pub index: usize,
    pub access: Access,
}

pub struct Region {
    range: VirtualRange,
    object: Arc<MemoryObject>,
    /// Byte offset of `range.base()` inside the object.
    offset: u64,
    access: Access,
    /// Pages are reachable from user mode.
    user: bool,
}

impl Region {
    /// # Errors
    /// - [`VmError::InvalidRange`] for an empty or unaligned range.
    /// - [`VmError::InvalidRegion`] for an unaligned offset, a window that
    ///   runs past the object, or a shared inode object mapped without the
    ///   `shared` bit.
    pub fn new(
        range: VirtualRange,
        object: Arc<MemoryObject>,
        offset: u64,
        access: Access,
    ) -> Result<Self, VmError> {
        if range.is_empty() || !range.is_page_aligned() {
            return Err(VmError::InvalidRange);
        }
        if !offset.is_multiple_of(PAGE_SIZE) {
            return Err(VmError::InvalidRegion);
        }
        let end = offset.checked_add(range.size()).ok_or(VmError::InvalidRegion)?;
        if end > object.size() {
            return Err(VmError::InvalidRegion);
        }
        let shared_inode = object
            .as_inode()
            .is_some_and(|inode| inode.sharing() == InodeSharing::Shared);
        if shared_inode && !access.shared() {
            return Err(VmError::InvalidRegion);
        }

        Ok(Self {
            range,
            object,
            offset,
            access,
            user: false,
        })
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> VirtualRange {
        self.range
    }

    #[inline]
    #[must_use]
    pub const fn object(&self) -> &Arc<MemoryObject> {
        &self.object
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    #[must_use]
    pub const fn access(&self) -> Access {
        self.access
    }

    #[inline]
    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.user
    }

    pub(crate) const fn set_user(&mut self, user: bool) {
        self.user = user;
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        self.range.contains(va)
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn first_index(&self) -> usize {
        (self.offset / PAGE_SIZE) as usize
    }

    /// Object page index of `va`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn page_index(&self, va: VirtualAddress) -> Option<usize> {
        self.contains(va)
            .then(|| self.first_index() + ((va.page_base() - self.range.base()) / PAGE_SIZE) as usize)
    }

    /// # Errors
    /// [`VmError::NotMapped`] if `va` lies outside the region.
    pub fn translate(&self, va: VirtualAddress) -> Result<ObjectPage, VmError> {
        let index = self.page_index(va).ok_or(VmError::NotMapped(va))?;
        Ok(ObjectPage {
            object: Arc::clone(&self.object),
            index,
            access: self.access,
        })
    }

    /// Object pages of this region that are resident.
    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.indexed_pages()
            .filter(|&(_, index)| self.object.frame(index).is_some())
            .count()
    }

    /// Window pages still marked copy-on-write.
    #[must_use]
    pub fn cow_pages(&self) -> usize {
        self.window().filter(|&index| self.object.should_cow(index)).count()
    }

    /// Bytes of the window waiting to be written back.
    #[must_use]
    pub fn dirty_bytes(&self) -> u64 {
        let pages = self.window().filter(|&index| self.object.is_dirty(index)).count();
        pages as u64 * PAGE_SIZE
    }

    /// Bytes of resident window pages whose frame is held by more than this
    /// object.
    #[must_use]
    pub fn shared_bytes(&self) -> u64 {
        let pages = self
            .window()
            .filter(|&index| self.object.is_frame_shared(index))
            .count();
        pages as u64 * PAGE_SIZE
    }

    fn window(&self) -> core::ops::Range<usize> {
        self.first_index()..self.first_index() + self.range.page_count()
    }

    fn indexed_pages(&self) -> impl Iterator<Item = (VirtualAddress, usize)> + use<> {
        self.range.pages().zip(self.first_index()..)
    }

    const fn mapping(&self, root: PageTableRoot) -> Mapping {
        Mapping {
            root,
            range: self.range,
            first_index: self.first_index(),
        }
    }

    /// Page-table flags for object page `index` right now.
    #[must_use]
    pub fn pte_flags(&self, index: usize) -> PteFlags {
        let writable = self.access.write()
            && !self.object.should_cow(index)
            && (!self.object.tracks_dirty() || self.object.is_dirty(index));
        PteFlags::new()
            .with_present(true)
            .with_writable(writable)
            .with_user(self.user)
            .with_executable(self.access.execute())
    }

    /// Resolves a fault on an address inside this region.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] and [`VmError::Io`] from paging in or
    /// breaking copy-on-write. Permission problems are not errors but
    /// [`PageFaultResponse::SignalSegfault`].
    pub fn handle_fault<P: Platform>(
        &self,
        vmm: &Vmm<P>,
        root: PageTableRoot,
        fault: &PageFault,
    ) -> Result<PageFaultResponse, VmError> {
        let Some(index) = self.page_index(fault.address()) else {
            return Ok(PageFaultResponse::SignalSegfault);
        };
        if !self.access.permits(fault.access()) {
            debug!(
                "{:?} access to {} denied by region {} ({:?})",
                fault.access(),
                fault.address(),
                self.range,
                self.access
            );
            return Ok(PageFaultResponse::SignalSegfault);
        }

        let frame = match fault.kind() {
            FaultKind::NotPresent => {
                let frame = self.object.page_in(vmm.frames(), vmm.platform(), index)?;
                if fault.is_write() {
                    self.prepare_write(vmm, index, frame)?
                } else {
                    frame
                }
            }
            FaultKind::ProtectionViolation => {
                if !fault.is_write() {
                    return Ok(PageFaultResponse::SignalSegfault);
                }
                let Some(frame) = self.object.frame(index) else {
                    return Ok(PageFaultResponse::SignalSegfault);
                };
                self.prepare_write(vmm, index, frame)?
            }
        };

        trace!("{:?} fault at {} resolved with {frame:?}", fault.kind(), fault.address());
        self.install(vmm, root, fault.address().page_base(), index, &frame)?;
        Ok(PageFaultResponse::Resolved)
    }

    fn prepare_write<P: Platform>(
        &self,
        vmm: &Vmm<P>,
        index: usize,
        frame: PhysicalFrame,
    ) -> Result<PhysicalFrame, VmError> {
        let frame = if self.object.should_cow(index) {
            // Our clone would count as a second holder.
            drop(frame);
            self.object.break_cow(vmm.frames(), vmm.platform(), index)?
        } else {
            frame
        };
        self.object.mark_dirty(index);
        Ok(frame)
    }

    /// Points `page` at `frame` with the flags the page needs now.
    fn install<P: Platform>(
        &self,
        vmm: &Vmm<P>,
        root: PageTableRoot,
        page: VirtualAddress,
        index: usize,
        frame: &PhysicalFrame,
    ) -> Result<(), VmError> {
        let platform = vmm.platform();
        let mappings = self.object.lock_mappings();
        let flags = self.pte_flags(index);
        match platform.translate(root, page) {
            Some(current) if current.frame == frame.address() => {
                platform.protect_page(root, page, flags);
            }
            Some(_) => {
                // Copy-on-write moved the page to a new frame.
                platform.unmap_page(root, page);
                platform.map_page(vmm.frames(), root, page, frame.address(), flags)?;
            }
            None => platform.map_page(vmm.frames(), root, page, frame.address(), flags)?,
        }
        platform.flush(root, VirtualRange::new(page, PAGE_SIZE));
        if let Some(mappings) = mappings.as_deref() {
            unmap_stale(platform, mappings, index, frame.address());
        }
        Ok(())
    }

    /// Registers the region with its object and maps every resident page of
    /// the window.
    ///
    /// On error the entries mapped so far are removed again and the region
    /// is not registered. Entries it did not install are left alone.
    pub(crate) fn map_all<P: Platform>(&self, vmm: &Vmm<P>, root: PageTableRoot) -> Result<(), VmError> {
        let platform = vmm.platform();
        let mut mappings = self.object.lock_mappings();
        for (va, index) in self.indexed_pages() {
            let Some(frame) = self.object.frame(index) else {
                continue;
            };
            if let Err(e) = platform.map_page(vmm.frames(), root, va, frame.address(), self.pte_flags(index)) {
                let mapped = self
                    .indexed_pages()
                    .take_while(|&(page, _)| page != va)
                    .filter(|&(_, index)| self.object.frame(index).is_some());
                for (page, _) in mapped {
                    platform.unmap_page(root, page);
                }
                platform.flush(root, self.range);
                return Err(e.into());
            }
        }
        if let Some(mappings) = mappings.as_mut() {
            mappings.push(self.mapping(root));
        }
        platform.flush(root, self.range);
        Ok(())
    }

    /// Rewrites the flags of every mapped page, e.g. after a fork made pages
    /// copy-on-write.
    pub(crate) fn remap<P: Platform>(&self, vmm: &Vmm<P>, root: PageTableRoot) {
        let platform = vmm.platform();
        let _mappings = self.object.lock_mappings();
        for (va, index) in self.indexed_pages() {
            platform.protect_page(root, va, self.pte_flags(index));
        }
        platform.flush(root, self.range);
    }

    /// Unmaps the window and takes the region off its object's list.
    pub(crate) fn unmap<P: Platform>(&self, vmm: &Vmm<P>, root: PageTableRoot) {
        let platform = vmm.platform();
        let mut mappings = self.object.lock_mappings();
        if let Some(mappings) = mappings.as_mut() {
            let this = self.mapping(root);
            mappings.retain(|mapping| *mapping != this);
        }
        for va in self.range.pages() {
            platform.unmap_page(root, va);
        }
        platform.flush(root, self.range);
    }

    /// Drops this region's hold on its object. The last holder flushes it.
    pub(crate) fn release<P: PhysMapper + Mmu>(self, platform: &P) -> Result<(), VmError> {
        match Arc::into_inner(self.object) {
            Some(object) => object.release(platform),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("range", &self.range)
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("access", &self.access)
            .field("object", &self.object)
            .finish()
    }
}
