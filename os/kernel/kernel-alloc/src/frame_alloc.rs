//! Physical frame allocator.
//!
//! Owns every usable page of RAM, partitioned into [`PhysicalZone`]s. Zones
//! are scanned in a fixed preference order: normal zones by ascending
//! address, then the low-memory zone. Allocation never blocks beyond the
//! zone locks and never panics on exhaustion; callers get [`OutOfMemory`].
//!
//! Pages can be committed ahead of use with [`FrameAllocator::commit`]. A
//! commitment is a promise: the allocator keeps that many pages free until
//! the holder of the [`CommittedFrames`] takes them or gives them back.

use crate::frame::PhysicalFrame;
use crate::phys_mapper::PhysMapper;
use crate::zone::{PhysicalZone, ZoneKind};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;
use kernel_info::boot::MemoryMapEntry;
use kernel_info::memory::LOW_MEMORY_LIMIT;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, align_down, align_up};
use kernel_sync::SpinLock;
use log::{debug, info};

/// No frame (or no run of frames) is available.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("out of physical memory")]
pub struct OutOfMemory;

/// Which zones an allocation may come from.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum FramePolicy {
    /// Any zone; low memory only once everything else is exhausted.
    #[default]
    Any,
    /// Only the low-memory zone (devices limited to 24-bit DMA).
    LowMemory,
}

impl FramePolicy {
    const fn admits(self, kind: ZoneKind) -> bool {
        match self {
            Self::Any => true,
            Self::LowMemory => matches!(kind, ZoneKind::Low),
        }
    }
}

#[derive(Debug, Default)]
pub struct FrameAllocator {
    /// Kept in preference order.
    zones: Vec<Arc<PhysicalZone>>,
    /// Pages promised to live commitments. Uncommitted allocations leave at
    /// least this many pages free.
    committed: Arc<SpinLock<usize>>,
}

impl FrameAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the allocator from the firmware memory map.
    ///
    /// Usable entries are rounded inwards to whole pages, page 0 is never
    /// handed out, `reserved` ranges (kernel image, boot structures) are
    /// carved out, and every piece is split at [`LOW_MEMORY_LIMIT`].
    /// Touching pieces are merged into one zone.
    #[must_use]
    pub fn from_memory_map(entries: &[MemoryMapEntry], reserved: &[Range<PhysicalAddress>]) -> Self {
        let mut pieces: Vec<(u64, u64)> = entries
            .iter()
            .filter(|e| e.is_usable())
            .map(|e| {
                (
                    align_up(e.base, PAGE_SIZE).max(PAGE_SIZE),
                    align_down(e.end(), PAGE_SIZE),
                )
            })
            .filter(|(start, end)| start < end)
            .collect();

        for hole in reserved {
            let hole = (
                align_down(hole.start.as_u64(), PAGE_SIZE),
                align_up(hole.end.as_u64(), PAGE_SIZE),
            );
            pieces = pieces
                .into_iter()
                .flat_map(|piece| subtract(piece, hole))
                .collect();
        }

        pieces = pieces
            .into_iter()
            .flat_map(|(start, end)| {
                if start < LOW_MEMORY_LIMIT && end > LOW_MEMORY_LIMIT {
                    [Some((start, LOW_MEMORY_LIMIT)), Some((LOW_MEMORY_LIMIT, end))]
                } else {
                    [Some((start, end)), None]
                }
            })
            .flatten()
            .collect();

        pieces.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(pieces.len());
        for (start, end) in pieces {
            match merged.last_mut() {
                Some(last) if last.1 >= start && zone_kind(*last) == zone_kind((start, end)) => {
                    last.1 = last.1.max(end);
                }
                _ => merged.push((start, end)),
            }
        }

        let mut allocator = Self::new();
        for (start, end) in merged {
            let zone = allocator.add_zone(PhysicalZone::new(
                zone_kind((start, end)),
                PhysicalAddress::new(start),
                PhysicalAddress::new(end),
            ));
            info!("Physical zone {zone:?}");
        }
        info!(
            "{} usable pages ({} KiB) in {} zones",
            allocator.total_pages(),
            allocator.total_pages() * 4,
            allocator.zones.len()
        );
        allocator
    }

    /// Registers a zone, keeping the preference order.
    pub fn add_zone(&mut self, zone: PhysicalZone) -> Arc<PhysicalZone> {
        let zone = Arc::new(zone);
        let key = |z: &PhysicalZone| (z.kind(), z.lower());
        let at = self
            .zones
            .partition_point(|existing| key(existing) < key(&zone));
        self.zones.insert(at, Arc::clone(&zone));
        zone
    }

    #[must_use]
    pub fn zones(&self) -> &[Arc<PhysicalZone>] {
        &self.zones
    }

    fn candidates(&self, policy: FramePolicy) -> impl Iterator<Item = &Arc<PhysicalZone>> {
        self.zones.iter().filter(move |z| policy.admits(z.kind()))
    }

    /// Whether `count` more pages can go without breaking a commitment.
    /// Called with the commitment lock held.
    fn uncommitted_available(&self, committed: usize, count: usize) -> bool {
        committed == 0 || self.free_pages() >= committed + count
    }

    /// Hands out one frame.
    ///
    /// # Errors
    /// [`OutOfMemory`] when every admissible zone is full or the remaining
    /// pages are committed.
    pub fn allocate(&self, policy: FramePolicy) -> Result<PhysicalFrame, OutOfMemory> {
        let committed = self.committed.lock_irq();
        if !self.uncommitted_available(*committed, 1) {
            return Err(OutOfMemory);
        }
        self.take_one(policy)
    }

    fn take_one(&self, policy: FramePolicy) -> Result<PhysicalFrame, OutOfMemory> {
        self.candidates(policy)
            .find_map(|zone| {
                zone.take()
                    .map(|pa| PhysicalFrame::owned(pa, Arc::clone(zone)))
            })
            .ok_or(OutOfMemory)
    }

    /// Sets `count` pages aside. Only the returned [`CommittedFrames`] can
    /// allocate them; whatever it has not taken when dropped is given back.
    ///
    /// # Errors
    /// [`OutOfMemory`] if fewer than `count` uncommitted pages are free.
    /// Nothing is committed then.
    pub fn commit(&self, count: usize) -> Result<CommittedFrames, OutOfMemory> {
        let mut committed = self.committed.lock_irq();
        if self.free_pages() < *committed + count {
            return Err(OutOfMemory);
        }
        *committed += count;
        debug!("Committed {count} pages ({} in total)", *committed);
        Ok(CommittedFrames {
            remaining: count,
            pool: Arc::clone(&self.committed),
        })
    }

    /// Pages promised to live commitments and not yet taken.
    #[must_use]
    pub fn committed_pages(&self) -> usize {
        *self.committed.lock_irq()
    }

    /// Hands out one frame filled with zeros.
    ///
    /// # Errors
    /// [`OutOfMemory`] when every admissible zone is full.
    pub fn allocate_zeroed<M: PhysMapper>(
        &self,
        policy: FramePolicy,
        mapper: &M,
    ) -> Result<PhysicalFrame, OutOfMemory> {
        let frame = self.allocate(policy)?;
        frame.zero(mapper);
        Ok(frame)
    }

    /// Hands out `count` physically consecutive frames from a single zone.
    ///
    /// Either all frames are reserved or none is.
    ///
    /// # Errors
    /// [`OutOfMemory`] when no admissible zone has a long enough free run.
    pub fn allocate_contiguous(
        &self,
        count: usize,
        policy: FramePolicy,
    ) -> Result<Vec<PhysicalFrame>, OutOfMemory> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let committed = self.committed.lock_irq();
        if !self.uncommitted_available(*committed, count) {
            return Err(OutOfMemory);
        }
        let (zone, base) = self
            .candidates(policy)
            .find_map(|zone| zone.take_run(count).map(|base| (zone, base)))
            .ok_or(OutOfMemory)?;
        debug!("Contiguous run of {count} frames at {base}");
        Ok((0..count as u64)
            .map(|i| PhysicalFrame::owned(base + i * PAGE_SIZE, Arc::clone(zone)))
            .collect())
    }

    /// Hands out a frame that is never returned to the free list.
    ///
    /// # Errors
    /// [`OutOfMemory`] when every admissible zone is full.
    pub fn allocate_permanent(&self, policy: FramePolicy) -> Result<PhysicalFrame, OutOfMemory> {
        let committed = self.committed.lock_irq();
        if !self.uncommitted_available(*committed, 1) {
            return Err(OutOfMemory);
        }
        self.candidates(policy)
            .find_map(|zone| zone.take())
            .map(PhysicalFrame::permanent)
            .ok_or(OutOfMemory)
    }

    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.zones.iter().map(|z| z.free_pages()).sum()
    }

    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.zones.iter().map(|z| z.page_count()).sum()
    }
}

/// Pages promised by [`FrameAllocator::commit`].
#[derive(Debug)]
#[must_use]
pub struct CommittedFrames {
    remaining: usize,
    pool: Arc<SpinLock<usize>>,
}

impl CommittedFrames {
    /// Promised pages not taken yet.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.remaining
    }

    /// Takes one of the promised pages.
    ///
    /// # Errors
    /// [`OutOfMemory`] once every promised page has been taken.
    ///
    /// # Panics
    /// If `frames` is not the allocator the pages were committed on.
    pub fn allocate(&mut self, frames: &FrameAllocator) -> Result<PhysicalFrame, OutOfMemory> {
        if self.remaining == 0 {
            return Err(OutOfMemory);
        }
        assert!(
            Arc::ptr_eq(&self.pool, &frames.committed),
            "committed pages taken from a different allocator"
        );
        let mut committed = self.pool.lock_irq();
        let frame = frames.take_one(FramePolicy::Any)?;
        *committed -= 1;
        self.remaining -= 1;
        Ok(frame)
    }
}

impl Drop for CommittedFrames {
    fn drop(&mut self) {
        if self.remaining > 0 {
            *self.pool.lock_irq() -= self.remaining;
        }
    }
}

/// Zone kind of a piece that does not straddle [`LOW_MEMORY_LIMIT`].
const fn zone_kind((_, end): (u64, u64)) -> ZoneKind {
    if end <= LOW_MEMORY_LIMIT {
        ZoneKind::Low
    } else {
        ZoneKind::Normal
    }
}

/// `piece` minus `hole`, as zero, one or two pieces.
fn subtract(piece: (u64, u64), hole: (u64, u64)) -> impl Iterator<Item = (u64, u64)> {
    let (start, end) = piece;
    let (hole_start, hole_end) = hole;
    let disjoint = hole_end <= start || hole_start >= end;
    let left = (!disjoint && hole_start > start).then_some((start, hole_start));
    let right = (!disjoint && hole_end < end).then_some((hole_end, end));
    let whole = disjoint.then_some(piece);
    [whole, left, right].into_iter().flatten()
}
