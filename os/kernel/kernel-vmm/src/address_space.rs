//! Address spaces: a page-table root plus the regions mapped through it.
//!
//! The region map and the range allocator always partition the bounds: a
//! range is either covered by exactly one region or free in the allocator.
//! Both live behind one lock together with a one-entry lookup cache, so a
//! region cannot disappear while a fault is being resolved against it.

use crate::error::VmError;
use crate::memory_object::MemoryObject;
use crate::region::{Access, PageFaultResponse, Region};
use crate::vmm::{Platform, Vmm};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use kernel_alloc::{FRAME_BYTES, FrameBytes, PhysMapper};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, VirtualRange};
use kernel_sync::{SpinLock, SpinLockGuard};
use kernel_vmem::{FaultAccess, Mmu, PageFault, PageTableRoot, Processor, RangeAllocError, RangeAllocator};
use log::{debug, trace, warn};

/// Page faults a single byte access may take before giving up.
const FAULT_RETRIES: usize = 2;

pub struct AddressSpace {
    root: PageTableRoot,
    user: bool,
    owns_root: bool,
    regions: SpinLock<RegionSet>,
}

/// The regions of one space and the free ranges between them.
pub struct RegionSet {
    regions: BTreeMap<VirtualAddress, Region>,
    ranges: RangeAllocator,
    /// Base of the region found by the last lookup.
    lookup_cache: Option<VirtualAddress>,
}

impl RegionSet {
    fn new(bounds: VirtualRange) -> Self {
        Self {
            regions: BTreeMap::new(),
            ranges: RangeAllocator::new(bounds),
            lookup_cache: None,
        }
    }

    #[must_use]
    pub const fn bounds(&self) -> VirtualRange {
        self.ranges.bounds()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> + '_ {
        self.regions.values()
    }

    #[must_use]
    pub const fn range_allocator(&self) -> &RangeAllocator {
        &self.ranges
    }

    #[must_use]
    pub const fn lookup_cache(&self) -> Option<VirtualAddress> {
        self.lookup_cache
    }

    /// Inserts `region` at its own range.
    ///
    /// # Errors
    /// - [`VmError::Overlap`] if any existing region intersects it.
    /// - [`VmError::InvalidRange`] if it leaves the bounds.
    ///
    /// # Panics
    /// If the region map and the range allocator disagree about the range.
    pub fn add_region(&mut self, region: Region) -> Result<&Region, VmError> {
        let range = region.range();
        if !self.bounds().contains_range(&range) {
            return Err(VmError::InvalidRange);
        }
        let overlaps = self.overlaps(range);
        match self.ranges.allocate_specific(range) {
            Ok(_) => assert!(!overlaps, "{range} is free but overlaps a region"),
            Err(RangeAllocError::Conflict(_)) => {
                assert!(overlaps, "{range} is allocated but no region covers it");
                return Err(VmError::Overlap(range));
            }
            Err(e) => return Err(e.into()),
        }
        Ok(self.insert_reserved(region))
    }

    fn insert_reserved(&mut self, region: Region) -> &Region {
        let base = region.range().base();
        self.regions.entry(base).or_insert(region)
    }

    fn overlaps(&self, range: VirtualRange) -> bool {
        self.regions
            .range(..range.end())
            .next_back()
            .is_some_and(|(_, region)| region.range().intersects(&range))
    }

    /// The region covering `va`, checking the lookup cache first.
    pub fn find_region_containing(&mut self, va: VirtualAddress) -> Option<&Region> {
        let cached = self
            .lookup_cache
            .filter(|base| self.regions.get(base).is_some_and(|region| region.contains(va)));
        let base = match cached {
            Some(base) => base,
            None => {
                let (&base, region) = self.regions.range(..=va).next_back()?;
                if !region.contains(va) {
                    return None;
                }
                self.lookup_cache = Some(base);
                base
            }
        };
        self.regions.get(&base)
    }

    /// Takes out the region covering exactly `range` and frees the range.
    fn take_region(&mut self, range: VirtualRange) -> Option<Region> {
        if self.regions.get(&range.base())?.range() != range {
            return None;
        }
        let region = self.regions.remove(&range.base())?;
        self.ranges.free(range);
        self.lookup_cache = None;
        Some(region)
    }

    fn take_all(&mut self) -> BTreeMap<VirtualAddress, Region> {
        for region in self.regions.values() {
            self.ranges.free(region.range());
        }
        self.lookup_cache = None;
        core::mem::take(&mut self.regions)
    }
}

impl AddressSpace {
    /// A space with a fresh page-table root.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the root table could not be allocated.
    pub fn new<P: Platform>(vmm: &Vmm<P>, bounds: VirtualRange, user: bool) -> Result<Self, VmError> {
        let root = vmm.platform().create_root(vmm.frames())?;
        debug!("Created address space {root:?} over {bounds}");
        Ok(Self {
            root,
            user,
            owns_root: true,
            regions: SpinLock::new(RegionSet::new(bounds)),
        })
    }

    /// A space over an existing root, which it will not destroy.
    #[must_use]
    pub fn with_root(root: PageTableRoot, bounds: VirtualRange, user: bool) -> Self {
        Self {
            root,
            user,
            owns_root: false,
            regions: SpinLock::new(RegionSet::new(bounds)),
        }
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PageTableRoot {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.user
    }

    #[must_use]
    pub fn bounds(&self) -> VirtualRange {
        self.regions.lock().bounds()
    }

    /// The space lock. Held during faults; take it before any object lock.
    pub fn lock(&self) -> SpinLockGuard<'_, RegionSet> {
        self.regions.lock()
    }

    /// Adds `region` at its own range and maps its resident pages.
    ///
    /// # Errors
    /// See [`RegionSet::add_region`]; [`VmError::OutOfMemory`] if page
    /// tables could not be allocated.
    pub fn add_region<P: Platform>(&self, vmm: &Vmm<P>, mut region: Region) -> Result<VirtualRange, VmError> {
        region.set_user(self.user);
        let mut set = self.lock();
        let range = set.add_region(region)?.range();
        self.map_new(vmm, &mut set, range)
    }

    /// Places a new region wherever the range allocator finds room,
    /// preferring `hint`.
    ///
    /// # Errors
    /// [`VmError::NoSpace`] if nothing fits; [`VmError::InvalidRegion`] if
    /// the window does not fit `object`.
    pub fn allocate_region<P: Platform>(
        &self,
        vmm: &Vmm<P>,
        hint: Option<VirtualAddress>,
        size: u64,
        object: Arc<MemoryObject>,
        offset: u64,
        access: Access,
    ) -> Result<VirtualRange, VmError> {
        let mut set = self.lock();
        let range = set.ranges.allocate(size, PAGE_SIZE, hint)?;
        let mut region = match Region::new(range, object, offset, access) {
            Ok(region) => region,
            Err(e) => {
                set.ranges.free(range);
                return Err(e);
            }
        };
        region.set_user(self.user);
        set.insert_reserved(region);
        self.map_new(vmm, &mut set, range)
    }

    /// Places a new region at exactly `range`.
    ///
    /// # Errors
    /// [`VmError::Overlap`] if the range is taken.
    pub fn allocate_region_at<P: Platform>(
        &self,
        vmm: &Vmm<P>,
        range: VirtualRange,
        object: Arc<MemoryObject>,
        offset: u64,
        access: Access,
    ) -> Result<VirtualRange, VmError> {
        self.add_region(vmm, Region::new(range, object, offset, access)?)
    }

    fn map_new<P: Platform>(
        &self,
        vmm: &Vmm<P>,
        set: &mut RegionSet,
        range: VirtualRange,
    ) -> Result<VirtualRange, VmError> {
        let mapped = match set.regions.get(&range.base()) {
            Some(region) => region.map_all(vmm, self.root),
            None => Ok(()),
        };
        if let Err(e) = mapped {
            drop(set.take_region(range));
            return Err(e);
        }
        debug!("Mapped {range} in {:?}", self.root);
        Ok(range)
    }

    /// Unmaps and removes the region covering exactly `range`.
    ///
    /// The removal always completes. If this was the last holder of an inode
    /// object, its write-back error is returned afterwards.
    ///
    /// # Errors
    /// [`VmError::NotMapped`] if no region covers exactly `range`;
    /// [`VmError::Io`] from the final flush.
    pub fn remove_region<P: Platform>(&self, vmm: &Vmm<P>, range: VirtualRange) -> Result<(), VmError> {
        let region = {
            let mut set = self.lock();
            let region = set.take_region(range).ok_or(VmError::NotMapped(range.base()))?;
            region.unmap(vmm, self.root);
            region
        };
        debug!("Removed {range} from {:?}", self.root);
        region.release(vmm.platform())
    }

    /// Writes back the dirty pages of the object behind the region covering
    /// `va`. Every space mapping the object loses write access to the
    /// written pages, so the next store marks them dirty again.
    ///
    /// # Errors
    /// [`VmError::NotMapped`] without a region; [`VmError::Io`] from the
    /// write-back (failed pages stay dirty).
    pub fn sync_region<P: Platform>(&self, vmm: &Vmm<P>, va: VirtualAddress) -> Result<usize, VmError> {
        let mut set = self.lock();
        let region = set.find_region_containing(va).ok_or(VmError::NotMapped(va))?;
        region.object().flush_dirty_pages(vmm.platform())
    }

    /// Resolves a fault in this space.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] and [`VmError::Io`] from the region.
    pub fn handle_fault<P: Platform>(&self, vmm: &Vmm<P>, fault: PageFault) -> Result<PageFaultResponse, VmError> {
        let mut set = self.lock();
        self.handle_fault_locked(vmm, &mut set, &fault)
    }

    fn handle_fault_locked<P: Platform>(
        &self,
        vmm: &Vmm<P>,
        set: &mut RegionSet,
        fault: &PageFault,
    ) -> Result<PageFaultResponse, VmError> {
        let Some(region) = set.find_region_containing(fault.address()) else {
            debug!("No region for {:?} fault at {}", fault.access(), fault.address());
            return Ok(PageFaultResponse::SignalSegfault);
        };
        let response = region.handle_fault(vmm, self.root, fault);
        if let Err(e) = &response {
            warn!("Fault at {} in {:?} failed: {e}", fault.address(), self.root);
        }
        response
    }

    /// A child space for `fork`. Private pages become copy-on-write in
    /// both spaces; shared regions keep sharing their object.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`]; the partly built child is torn down.
    pub fn clone_for_fork<P: Platform>(&self, vmm: &Vmm<P>) -> Result<Self, VmError> {
        let child = Self::new(vmm, self.bounds(), self.user)?;
        if let Err(e) = self.fork_into(vmm, &child) {
            if let Err(flush) = child.destroy(vmm) {
                warn!("Tearing down half-forked space: {flush}");
            }
            return Err(e);
        }
        debug!("Forked {:?} into {:?}", self.root, child.root);
        Ok(child)
    }

    fn fork_into<P: Platform>(&self, vmm: &Vmm<P>, child: &Self) -> Result<(), VmError> {
        let parent = self.lock();
        let mut child_set = child.lock();
        // Regions sharing an object in the parent share its copy in the child.
        let mut copies = BTreeMap::new();
        for region in parent.iter() {
            let object = copies
                .entry(Arc::as_ptr(region.object()))
                .or_insert_with(|| region.object().try_clone());
            let mut copy = Region::new(region.range(), Arc::clone(object), region.offset(), region.access())?;
            copy.set_user(child.user);
            child_set.add_region(copy)?.map_all(vmm, child.root)?;
            region.remap(vmm, self.root);
        }
        Ok(())
    }

    /// Copies bytes out of this space, faulting pages in as needed.
    ///
    /// # Errors
    /// [`VmError::Segfault`] for an address the space does not allow
    /// reading; paging errors otherwise.
    pub fn read_bytes<P: Platform>(&self, vmm: &Vmm<P>, va: VirtualAddress, buf: &mut [u8]) -> Result<(), VmError> {
        self.access_bytes(vmm, va, buf.len(), FaultAccess::Read, |bytes, done| {
            buf[done..done + bytes.len()].copy_from_slice(bytes);
        })
    }

    /// Copies bytes into this space, faulting and breaking copy-on-write as
    /// a store from the owning context would.
    ///
    /// # Errors
    /// [`VmError::Segfault`] for an address the space does not allow
    /// writing; paging errors otherwise.
    pub fn write_bytes<P: Platform>(&self, vmm: &Vmm<P>, va: VirtualAddress, data: &[u8]) -> Result<(), VmError> {
        self.access_bytes(vmm, va, data.len(), FaultAccess::Write, |bytes, done| {
            bytes.copy_from_slice(&data[done..done + bytes.len()]);
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn access_bytes<P: Platform>(
        &self,
        vmm: &Vmm<P>,
        va: VirtualAddress,
        len: usize,
        access: FaultAccess,
        mut copy: impl FnMut(&mut [u8], usize),
    ) -> Result<(), VmError> {
        let mut set = self.lock();
        let mut done = 0;
        while done < len {
            let address = va.checked_add(done as u64).ok_or(VmError::InvalidRange)?;
            let offset = address.page_offset() as usize;
            let chunk = (len - done).min(FRAME_BYTES - offset);
            let frame = self.resolve_locked(vmm, &mut set, address.page_base(), access)?;

            // SAFETY: the frame is mapped by a region of this space, which
            // cannot go away while the space lock is held.
            let bytes = unsafe { vmm.platform().phys_to_mut::<FrameBytes>(frame) };
            copy(&mut bytes[offset..offset + chunk], done);
            done += chunk;
        }
        trace!("{access:?} of {len} bytes at {va} in {:?}", self.root);
        Ok(())
    }

    fn resolve_locked<P: Platform>(
        &self,
        vmm: &Vmm<P>,
        set: &mut RegionSet,
        page: VirtualAddress,
        access: FaultAccess,
    ) -> Result<PhysicalAddress, VmError> {
        for _ in 0..=FAULT_RETRIES {
            let fault = match vmm.platform().translate(self.root, page) {
                Some(t) if access != FaultAccess::Write || t.flags.writable() => return Ok(t.frame),
                Some(_) => PageFault::protection(page, access),
                None => PageFault::not_present(page, access),
            };
            if self.handle_fault_locked(vmm, set, &fault.from_user(self.user))?
                == PageFaultResponse::SignalSegfault
            {
                return Err(VmError::Segfault(page));
            }
        }
        Err(VmError::Segfault(page))
    }

    /// Removes every region and destroys the root if this space owns it.
    ///
    /// # Errors
    /// The first write-back error; teardown completes regardless.
    pub fn destroy<P: Platform>(self, vmm: &Vmm<P>) -> Result<(), VmError> {
        debug_assert!(
            !self.owns_root || vmm.platform().active_root() != self.root,
            "destroying the active address space"
        );
        let regions = {
            let mut set = self.lock();
            let regions = set.take_all();
            for region in regions.values() {
                region.unmap(vmm, self.root);
            }
            regions
        };

        let mut first_error = None;
        for region in regions.into_values() {
            if let Err(e) = region.release(vmm.platform()) {
                first_error.get_or_insert(e);
            }
        }
        if self.owns_root {
            vmm.platform().destroy_root(self.root);
        }
        debug!("Destroyed address space {:?}", self.root);

        first_error.map_or(Ok(()), Err)
    }

    #[must_use]
    pub fn region_count(&self) -> usize {
        self.lock().len()
    }

    /// Bytes covered by regions.
    #[must_use]
    pub fn virtual_bytes(&self) -> u64 {
        self.lock().iter().map(|region| region.range().size()).sum()
    }

    /// Bytes of resident object pages reachable through this space's
    /// regions. Pages shared with other spaces are counted here too.
    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        let pages: usize = self.lock().iter().map(Region::resident_pages).sum();
        pages as u64 * PAGE_SIZE
    }

    pub fn dump_regions(&self) {
        let set = self.lock();
        debug!("{:?}: {} regions", self.root, set.len());
        for region in set.iter() {
            debug!("  {region:?}");
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let regions = self.regions.get_mut().len();
        if regions != 0 {
            warn!(
                "Address space {:?} dropped with {regions} regions; its pages and tables leak",
                self.root
            );
        }
    }
}
