//! Virtual range allocator.
//!
//! Tracks the free virtual intervals inside an address space's bounds. Free
//! intervals are kept in an address-ordered map, so the lowest suitable
//! interval is found by a forward scan and neighbours of a freed range are
//! one lookup away.
//!
//! # Invariants
//! - Free intervals are disjoint, non-empty, page aligned, inside `bounds`.
//! - Free intervals are maximal: no two of them touch. Every `free` merges
//!   with both neighbours immediately.
//! - Free intervals plus the ranges handed out cover `bounds` exactly.

use alloc::collections::BTreeMap;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, VirtualRange, align_up};
use log::trace;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RangeAllocError {
    #[error("no free virtual range is large enough")]
    NoSpace,
    #[error("range {0} conflicts with an existing allocation")]
    Conflict(VirtualRange),
    #[error("range {0} lies outside the allocator bounds")]
    OutOfBounds(VirtualRange),
    #[error("zero-sized or misaligned request")]
    InvalidSize,
}

#[derive(Clone, PartialEq, Eq)]
pub struct RangeAllocator {
    bounds: VirtualRange,
    /// Free intervals: base -> end (exclusive).
    free: BTreeMap<u64, u64>,
}

impl RangeAllocator {
    /// An allocator with all of `bounds` free.
    ///
    /// # Panics
    /// If `bounds` is empty or not page aligned.
    #[must_use]
    pub fn new(bounds: VirtualRange) -> Self {
        assert!(!bounds.is_empty() && bounds.is_page_aligned(), "bad bounds {bounds}");
        let mut free = BTreeMap::new();
        free.insert(bounds.base().as_u64(), bounds.end().as_u64());
        Self { bounds, free }
    }

    #[inline]
    #[must_use]
    pub const fn bounds(&self) -> VirtualRange {
        self.bounds
    }

    /// Reserves `size` bytes (rounded up to whole pages) at an `alignment`
    /// boundary (at least one page).
    ///
    /// If `hint` (aligned up) starts a large enough stretch of free space, the
    /// range is placed there. Otherwise the lowest suitable address wins.
    ///
    /// # Errors
    /// - [`RangeAllocError::InvalidSize`] for a zero size or an alignment that
    ///   is not a power of two.
    /// - [`RangeAllocError::NoSpace`] if no free interval fits.
    pub fn allocate(
        &mut self,
        size: u64,
        alignment: u64,
        hint: Option<VirtualAddress>,
    ) -> Result<VirtualRange, RangeAllocError> {
        let (size, alignment) = normalize(size, alignment)?;

        let at_hint = hint.and_then(|hint| self.fit_at(align_up(hint.as_u64(), alignment), size));
        let range = at_hint
            .or_else(|| {
                self.free.iter().find_map(|(&start, &end)| {
                    let base = align_up(start, alignment);
                    fits(base, size, end).then(|| make_range(base, size))
                })
            })
            .ok_or(RangeAllocError::NoSpace)?;

        trace!("Allocated {range} (hint {hint:?})");
        self.carve(range);
        Ok(range)
    }

    /// Reserves exactly `range`.
    ///
    /// # Errors
    /// - [`RangeAllocError::InvalidSize`] for an empty or misaligned range.
    /// - [`RangeAllocError::OutOfBounds`] if it leaves the bounds.
    /// - [`RangeAllocError::Conflict`] if any part is already allocated.
    pub fn allocate_specific(&mut self, range: VirtualRange) -> Result<VirtualRange, RangeAllocError> {
        if range.is_empty() || !range.is_page_aligned() {
            return Err(RangeAllocError::InvalidSize);
        }
        if !self.bounds.contains_range(&range) {
            return Err(RangeAllocError::OutOfBounds(range));
        }
        if !self.is_free(range) {
            return Err(RangeAllocError::Conflict(range));
        }
        self.carve(range);
        Ok(range)
    }

    /// Returns `range` to the free set, merging with free neighbours.
    ///
    /// # Panics
    /// If `range` is misaligned, outside the bounds, or overlaps free space.
    /// Each of these means the caller's bookkeeping is corrupt.
    pub fn free(&mut self, range: VirtualRange) {
        assert!(
            !range.is_empty() && range.is_page_aligned() && self.bounds.contains_range(&range),
            "freeing invalid range {range}"
        );
        let mut start = range.base().as_u64();
        let mut end = range.end().as_u64();

        assert!(
            self.free.range(start..end).next().is_none(),
            "freeing {range} which overlaps free space"
        );
        if let Some((&prev_start, &prev_end)) = self.free.range(..start).next_back() {
            assert!(prev_end <= start, "freeing {range} which overlaps free space");
            if prev_end == start {
                self.free.remove(&prev_start);
                start = prev_start;
            }
        }
        if let Some(next_end) = self.free.remove(&end) {
            end = next_end;
        }
        self.free.insert(start, end);
        trace!("Freed {range}");

        #[cfg(debug_assertions)]
        self.assert_invariants();
    }

    /// Whether all of `range` is currently free.
    #[must_use]
    pub fn is_free(&self, range: VirtualRange) -> bool {
        self.free
            .range(..=range.base().as_u64())
            .next_back()
            .is_some_and(|(_, &end)| range.end().as_u64() <= end)
    }

    /// The free intervals in address order.
    pub fn free_ranges(&self) -> impl Iterator<Item = VirtualRange> + '_ {
        self.free
            .iter()
            .map(|(&start, &end)| make_range(start, end - start))
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free.iter().map(|(start, end)| end - start).sum()
    }

    /// Checks the maximal-interval invariant.
    ///
    /// # Panics
    /// If two free intervals touch or overlap, or one leaves the bounds.
    pub fn assert_invariants(&self) {
        let mut previous_end = None;
        for (&start, &end) in &self.free {
            assert!(start < end, "empty free interval at {start:#x}");
            assert!(
                start >= self.bounds.base().as_u64() && end <= self.bounds.end().as_u64(),
                "free interval [{start:#x}, {end:#x}) outside {}",
                self.bounds
            );
            if let Some(previous_end) = previous_end {
                assert!(
                    previous_end < start,
                    "free intervals not merged at {start:#x}"
                );
            }
            previous_end = Some(end);
        }
    }

    /// The range `[base, base + size)` if it lies inside one free interval.
    fn fit_at(&self, base: u64, size: u64) -> Option<VirtualRange> {
        let (&start, &end) = self.free.range(..=base).next_back()?;
        (base >= start && fits(base, size, end)).then(|| make_range(base, size))
    }

    /// Removes `range` from the free interval that contains it.
    fn carve(&mut self, range: VirtualRange) {
        let base = range.base().as_u64();
        let Some((&start, &end)) = self.free.range(..=base).next_back() else {
            panic!("carving {range} from allocated space");
        };
        assert!(range.end().as_u64() <= end, "carving {range} across allocated space");
        self.free.remove(&start);
        if start < base {
            self.free.insert(start, base);
        }
        if range.end().as_u64() < end {
            self.free.insert(range.end().as_u64(), end);
        }
    }
}

impl core::fmt::Debug for RangeAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RangeAllocator")
            .field("bounds", &self.bounds)
            .field("free", &self.free_ranges().collect::<alloc::vec::Vec<_>>())
            .finish()
    }
}

fn normalize(size: u64, alignment: u64) -> Result<(u64, u64), RangeAllocError> {
    if size == 0 || !alignment.max(1).is_power_of_two() {
        return Err(RangeAllocError::InvalidSize);
    }
    Ok((align_up(size, PAGE_SIZE), alignment.max(PAGE_SIZE)))
}

fn fits(base: u64, size: u64, end: u64) -> bool {
    base.checked_add(size).is_some_and(|top| top <= end)
}

const fn make_range(base: u64, size: u64) -> VirtualRange {
    VirtualRange::new(VirtualAddress::new(base), size)
}
