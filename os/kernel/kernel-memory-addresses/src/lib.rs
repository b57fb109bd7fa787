//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses and virtual ranges used in
//! frame allocation, page-table and address-space code.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`PhysicalAddress`] | A physical (bus) address: RAM frames or MMIO. |
//! | [`VirtualAddress`] | A page-table translated address. |
//! | [`VirtualRange`] | A half-open interval `[base, base + size)` of virtual addresses. |
//! | [`PageSize`] / [`Size4K`] | The page granularity used by the memory core. |
//!
//! Mixing the two address kinds is a compile-time error. Both are
//! `#[repr(transparent)]` over `u64` and all helpers are `const fn`.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0000_0000_0080_1234);
//! assert_eq!(va.align_down(PAGE_SIZE).as_u64(), 0x0080_1000);
//! assert_eq!(va.page_offset(), 0x234);
//!
//! let range = VirtualRange::new(VirtualAddress::new(0x1000), 3 * PAGE_SIZE);
//! assert_eq!(range.end().as_u64(), 0x4000);
//! assert!(!range.contains(va.align_down(PAGE_SIZE)));
//! assert_eq!(range.page_count(), 3);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

use core::fmt;
use core::hash::Hash;
use core::ops::{Add, AddAssign, Sub};

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;

    fn as_str() -> &'static str;
}

/// 4 KiB page (4096 bytes), the only granularity the memory core maps with.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;

    fn as_str() -> &'static str {
        "4K"
    }
}

/// Size in bytes of one page.
pub const PAGE_SIZE: u64 = Size4K::SIZE;

/// Rounds `value` down to a multiple of `align` (a power of two).
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Rounds `value` up to a multiple of `align` (a power of two).
///
/// Saturates to the highest aligned value instead of wrapping.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0x1001, 0x1000), 0x2000);
/// assert_eq!(align_up(0x2000, 0x1000), 0x2000);
/// ```
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => v & !(align - 1),
        None => u64::MAX & !(align - 1),
    }
}

/// Number of pages needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    align_up(bytes, PAGE_SIZE) >> Size4K::SHIFT
}

macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(u64);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            #[inline]
            #[must_use]
            pub const fn zero() -> Self {
                Self(0)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            #[inline]
            #[must_use]
            pub const fn is_aligned(self, align: u64) -> bool {
                self.0 & (align - 1) == 0
            }

            #[inline]
            #[must_use]
            pub const fn is_page_aligned(self) -> bool {
                self.is_aligned(PAGE_SIZE)
            }

            #[inline]
            #[must_use]
            pub const fn align_down(self, align: u64) -> Self {
                Self(align_down(self.0, align))
            }

            #[inline]
            #[must_use]
            pub const fn align_up(self, align: u64) -> Self {
                Self(align_up(self.0, align))
            }

            /// Base of the 4 KiB page containing this address.
            #[inline]
            #[must_use]
            pub const fn page_base(self) -> Self {
                self.align_down(PAGE_SIZE)
            }

            /// Offset of this address within its 4 KiB page.
            #[inline]
            #[must_use]
            pub const fn page_offset(self) -> u64 {
                self.0 & (PAGE_SIZE - 1)
            }

            #[inline]
            #[must_use]
            pub const fn checked_add(self, rhs: u64) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "(0x{:016X})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:016X}", self.0)
            }
        }

        impl Add<u64> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<u64> for $name {
            #[inline]
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }

        /// Distance in bytes between two addresses.
        impl Sub for $name {
            type Output = u64;

            #[inline]
            fn sub(self, rhs: Self) -> u64 {
                self.0 - rhs.0
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(v: u64) -> Self {
                Self::new(v)
            }
        }
    };
}

address_type!(
    /// A physical memory address (RAM frame or MMIO).
    ///
    /// Carries no validation; it only tags the value as physical so it cannot
    /// be handed to code expecting a virtual address.
    PhysicalAddress,
    "PA"
);

address_type!(
    /// A virtual (page-table translated) address.
    ///
    /// Canonicality is not checked at runtime.
    VirtualAddress,
    "VA"
);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    #[inline]
    #[must_use]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

/// A half-open interval `[base, base + size)` of virtual addresses.
///
/// An empty range (`size == 0`) contains nothing and intersects nothing.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualRange {
    base: VirtualAddress,
    size: u64,
}

impl VirtualRange {
    #[inline]
    #[must_use]
    pub const fn new(base: VirtualAddress, size: u64) -> Self {
        Self { base, size }
    }

    /// Builds the range `[start, end)`. Returns `None` if `end < start`.
    #[inline]
    #[must_use]
    pub const fn from_bounds(start: VirtualAddress, end: VirtualAddress) -> Option<Self> {
        if end.as_u64() < start.as_u64() {
            return None;
        }
        Some(Self::new(start, end.as_u64() - start.as_u64()))
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// First address past the range.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.size)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(&self) -> bool {
        self.base.is_page_aligned() && self.size & (PAGE_SIZE - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() - self.base.as_u64() < self.size
    }

    /// Whether `other` lies entirely within `self`.
    #[inline]
    #[must_use]
    pub const fn contains_range(&self, other: &Self) -> bool {
        other.base.as_u64() >= self.base.as_u64()
            && other.end().as_u64() <= self.end().as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn intersects(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.base.as_u64() < other.end().as_u64()
            && other.base.as_u64() < self.end().as_u64()
    }

    /// Number of whole pages covered; partial trailing pages count.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn page_count(&self) -> usize {
        pages_for(self.size) as usize
    }

    /// Base address of every page in the range.
    pub fn pages(&self) -> impl Iterator<Item = VirtualAddress> + use<> {
        let base = self.base;
        (0..self.page_count() as u64).map(move |i| base + i * PAGE_SIZE)
    }
}

impl fmt::Debug for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VR({self})")
    }
}

impl fmt::Display for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.base, self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        let a = PhysicalAddress::new(0x12345);
        assert_eq!(a.page_base().as_u64(), 0x12000);
        assert_eq!(a.page_offset(), 0x345);
        assert_eq!(a.align_up(PAGE_SIZE).as_u64(), 0x13000);
        assert!(!a.is_page_aligned());
        assert!(a.page_base().is_page_aligned());
    }

    #[test]
    fn align_up_saturates() {
        assert_eq!(align_up(u64::MAX - 5, 0x1000), u64::MAX & !0xFFF);
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(0x2000), 2);
    }

    #[test]
    fn range_containment_and_intersection() {
        let r = VirtualRange::new(VirtualAddress::new(0x1000), 0x2000);
        assert!(r.contains(VirtualAddress::new(0x1000)));
        assert!(r.contains(VirtualAddress::new(0x2FFF)));
        assert!(!r.contains(VirtualAddress::new(0x3000)));
        assert!(!r.contains(VirtualAddress::new(0x0FFF)));

        let touching = VirtualRange::new(VirtualAddress::new(0x3000), 0x1000);
        assert!(!r.intersects(&touching));
        let overlapping = VirtualRange::new(VirtualAddress::new(0x2000), 0x2000);
        assert!(r.intersects(&overlapping));
        assert!(!r.intersects(&VirtualRange::new(VirtualAddress::new(0x1000), 0)));

        let inner = VirtualRange::new(VirtualAddress::new(0x2000), 0x1000);
        assert!(r.contains_range(&inner));
        assert!(!r.contains_range(&overlapping));
    }

    #[test]
    fn range_pages() {
        let r = VirtualRange::from_bounds(VirtualAddress::new(0x4000), VirtualAddress::new(0x7000))
            .unwrap();
        let pages: Vec<_> = r.pages().map(VirtualAddress::as_u64).collect();
        assert_eq!(pages, vec![0x4000, 0x5000, 0x6000]);
        assert!(VirtualRange::from_bounds(VirtualAddress::new(2), VirtualAddress::new(1)).is_none());
    }

    #[test]
    fn formatting() {
        let pa = PhysicalAddress::new(0x1000);
        assert_eq!(format!("{pa:?}"), "PA(0x0000000000001000)");
        assert_eq!(format!("{pa}"), "0x0000000000001000");
        let r = VirtualRange::new(VirtualAddress::new(0x1000), 0x1000);
        assert_eq!(format!("{r}"), "[0x0000000000001000, 0x0000000000002000)");
    }
}
