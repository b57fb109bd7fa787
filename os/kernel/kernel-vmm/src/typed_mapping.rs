//! A `T` living at a known physical address, viewed through a temporary
//! mapping.
//!
//! Firmware tables, device structures and pages handed over by other
//! subsystems are reached this way. The wrapped memory is never freed by
//! the mapping.

use crate::address_space::AddressSpace;
use crate::error::VmError;
use crate::memory_object::MemoryObject;
use crate::region::Access;
use crate::vmm::{Platform, Vmm};
use core::marker::PhantomData;
use core::ops::Deref;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, VirtualRange, align_up};
use kernel_vmem::Processor;
use log::warn;

pub struct TypedMapping<'a, T, P: Platform> {
    vmm: &'a Vmm<P>,
    space: &'a AddressSpace,
    region: VirtualRange,
    address: VirtualAddress,
    writable: bool,
    _value: PhantomData<*mut T>,
}

impl<'a, T, P: Platform> TypedMapping<'a, T, P> {
    /// # Errors
    /// [`VmError::InvalidRange`] if `pa` is not aligned for `T`;
    /// [`VmError::NoSpace`] if `space` is full.
    pub fn map_readonly(vmm: &'a Vmm<P>, space: &'a AddressSpace, pa: PhysicalAddress) -> Result<Self, VmError> {
        Self::map(vmm, space, pa, false)
    }

    /// # Errors
    /// [`VmError::InvalidRange`] if `pa` is not aligned for `T`;
    /// [`VmError::NoSpace`] if `space` is full.
    pub fn map_writable(vmm: &'a Vmm<P>, space: &'a AddressSpace, pa: PhysicalAddress) -> Result<Self, VmError> {
        Self::map(vmm, space, pa, true)
    }

    fn map(vmm: &'a Vmm<P>, space: &'a AddressSpace, pa: PhysicalAddress, writable: bool) -> Result<Self, VmError> {
        if !pa.is_aligned(align_of::<T>() as u64) {
            return Err(VmError::InvalidRange);
        }
        let first = pa.page_base();
        let end = pa
            .checked_add(size_of::<T>().max(1) as u64)
            .ok_or(VmError::InvalidRange)?;
        let size = align_up(end.as_u64(), PAGE_SIZE) - first.as_u64();

        let object = MemoryObject::for_physical_range(first, size)?;
        let access = if writable { Access::READ_WRITE } else { Access::READ };
        let region = space.allocate_region(vmm, None, size, object, 0, access)?;

        Ok(Self {
            vmm,
            space,
            region,
            address: region.base() + pa.page_offset(),
            writable,
            _value: PhantomData,
        })
    }

    /// Virtual address of the value.
    #[inline]
    #[must_use]
    pub const fn address(&self) -> VirtualAddress {
        self.address
    }

    /// Pages this mapping occupies.
    #[inline]
    #[must_use]
    pub const fn region(&self) -> VirtualRange {
        self.region
    }

    #[must_use]
    #[allow(clippy::cast_ptr_alignment)]
    pub fn get(&self) -> &T {
        // SAFETY: the region maps the value's pages for the mapping's
        // lifetime and the address was checked for alignment.
        unsafe { &*self.vmm.platform().pointer_to(self.address).cast::<T>() }
    }

    /// `None` for read-only mappings.
    #[must_use]
    #[allow(clippy::cast_ptr_alignment)]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        if !self.writable {
            return None;
        }
        // SAFETY: as in `get`; the region is writable and `&mut self` keeps
        // this the only reference through the mapping.
        Some(unsafe { &mut *self.vmm.platform().pointer_to(self.address).cast::<T>() })
    }
}

impl<T, P: Platform> Deref for TypedMapping<'_, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get()
    }
}

impl<T, P: Platform> Drop for TypedMapping<'_, T, P> {
    fn drop(&mut self) {
        if let Err(e) = self.space.remove_region(self.vmm, self.region) {
            warn!("Unmapping typed mapping at {}: {e}", self.region);
        }
    }
}
