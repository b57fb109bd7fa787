//! # Touching physical memory
//!
//! Code can only dereference virtual addresses. A [`PhysMapper`] turns a
//! physical address into a usable reference; the strategy differs between the
//! running kernel (a higher-half direct map) and host tests (a vector of
//! page-aligned buffers standing in for RAM).
//!
//! ## Example
//! ```rust,no_run
//! use kernel_alloc::phys_mapper::{HhdmPhysMapper, PhysMapper};
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let mapper = HhdmPhysMapper;
//! unsafe {
//!     let word: &mut u64 = mapper.phys_to_mut(PhysicalAddress::new(0x1234_0000));
//!     *word = 0;
//! }
//! ```

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::PhysicalAddress;

/// Converts physical addresses into references.
pub trait PhysMapper {
    /// Returns a mutable reference to a `T` living at `pa`.
    ///
    /// # Safety
    /// - `pa` must be covered by the mapping for `size_of::<T>()` bytes and
    ///   suitably aligned for `T`.
    /// - The caller must not create aliasing mutable references that are used
    ///   concurrently in conflicting ways.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// [`PhysMapper`] for kernels with a higher-half direct map (HHDM).
///
/// Every physical address is visible at `HHDM_BASE + pa`.
///
/// # Safety
/// The HHDM mapping must be present and cover the referenced physical range.
#[derive(Debug, Default, Copy, Clone)]
pub struct HhdmPhysMapper;

impl HhdmPhysMapper {
    /// The direct-map virtual address of `pa`.
    #[inline]
    #[must_use]
    pub const fn virtual_address(pa: PhysicalAddress) -> u64 {
        HHDM_BASE + pa.as_u64()
    }
}

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = Self::virtual_address(pa) as *mut T;
        // SAFETY: Caller must ensure the physical address is valid and mapped via HHDM.
        unsafe { &mut *va }
    }
}
