//! Physical zones.
//!
//! A zone is a page-aligned interval `[lower, upper)` of usable RAM with its
//! own free index and its own lock, so processors allocating from different
//! zones never contend.

use crate::bitmap::Bitmap;
use core::fmt;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Size4K, PageSize};
use kernel_sync::TicketMutex;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum ZoneKind {
    /// Normal RAM above the low-memory limit.
    Normal,
    /// RAM below the low-memory limit (legacy DMA); handed out last.
    Low,
}

pub struct PhysicalZone {
    kind: ZoneKind,
    lower: PhysicalAddress,
    pages: usize,
    state: TicketMutex<ZoneState>,
}

struct ZoneState {
    /// One bit per page; set means free.
    free: Bitmap,
    free_count: usize,
    /// No page below this index is free.
    lowest_free: usize,
}

impl PhysicalZone {
    /// # Panics
    /// If the bounds are not page aligned or the interval is empty.
    #[must_use]
    pub fn new(kind: ZoneKind, lower: PhysicalAddress, upper: PhysicalAddress) -> Self {
        assert!(lower.is_page_aligned() && upper.is_page_aligned());
        assert!(upper > lower, "empty zone at {lower}");
        let pages = usize::try_from((upper - lower) >> Size4K::SHIFT).unwrap_or(usize::MAX);
        Self {
            kind,
            lower,
            pages,
            state: TicketMutex::new(ZoneState {
                free: Bitmap::new(pages, true),
                free_count: pages,
                lowest_free: 0,
            }),
        }
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> ZoneKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn lower(&self) -> PhysicalAddress {
        self.lower
    }

    #[inline]
    #[must_use]
    pub const fn upper(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.lower.as_u64() + self.pages as u64 * PAGE_SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> usize {
        self.pages
    }

    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.state.lock_irq().free_count
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa >= self.lower && pa < self.upper()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn index_of(&self, pa: PhysicalAddress) -> usize {
        ((pa - self.lower) >> Size4K::SHIFT) as usize
    }

    fn address_of(&self, index: usize) -> PhysicalAddress {
        self.lower + index as u64 * PAGE_SIZE
    }

    /// Claims the lowest free page.
    pub(crate) fn take(&self) -> Option<PhysicalAddress> {
        let mut state = self.state.lock_irq();
        if state.free_count == 0 {
            return None;
        }
        let index = state.free.find_first_from(state.lowest_free, true)?;
        state.free.set(index, false);
        state.free_count -= 1;
        state.lowest_free = index + 1;
        Some(self.address_of(index))
    }

    /// Claims `count` consecutive free pages, or nothing.
    pub(crate) fn take_run(&self, count: usize) -> Option<PhysicalAddress> {
        let mut state = self.state.lock_irq();
        if state.free_count < count {
            return None;
        }
        let index = state.free.find_run(count, true)?;
        state.free.set_range(index, count, false);
        state.free_count -= count;
        if index == state.lowest_free {
            state.lowest_free = index + count;
        }
        Some(self.address_of(index))
    }

    /// Returns a page to the free index.
    ///
    /// # Panics
    /// If the page is outside the zone or already free.
    pub(crate) fn release(&self, pa: PhysicalAddress) {
        assert!(self.contains(pa), "{pa:?} released to foreign zone {self:?}");
        let index = self.index_of(pa);
        let mut state = self.state.lock_irq();
        assert!(!state.free.get(index), "double free of {pa:?}");
        state.free.set(index, true);
        state.free_count += 1;
        state.lowest_free = state.lowest_free.min(index);
    }
}

impl fmt::Debug for PhysicalZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysicalZone({:?}, {}..{}, {} pages)",
            self.kind,
            self.lower,
            self.upper(),
            self.pages
        )
    }
}
