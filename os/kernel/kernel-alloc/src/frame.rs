//! Reference-counted physical frames.
//!
//! A [`PhysicalFrame`] is a shared handle to one 4 KiB page of physical
//! memory. Cloning adds an owner; when the last owner of a frame that came
//! from a zone goes away, the page goes back to that zone's free index.
//! Frames flagged `exempt_from_free_list` (permanently reserved pages, or
//! wrappers around memory the allocator does not own) are never returned.

use crate::phys_mapper::PhysMapper;
use crate::zone::PhysicalZone;
use alloc::sync::Arc;
use core::fmt;
use kernel_memory_addresses::PhysicalAddress;

/// Size of one frame in bytes.
pub const FRAME_BYTES: usize = 4096;

/// The bytes of one frame as seen through a [`PhysMapper`].
pub type FrameBytes = [u8; FRAME_BYTES];

#[derive(Clone)]
pub struct PhysicalFrame {
    inner: Arc<FrameInner>,
}

struct FrameInner {
    address: PhysicalAddress,
    /// `None` for frames exempt from the free list.
    home: Option<Arc<PhysicalZone>>,
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        if let Some(zone) = self.home.take() {
            zone.release(self.address);
        }
    }
}

impl PhysicalFrame {
    pub(crate) fn owned(address: PhysicalAddress, zone: Arc<PhysicalZone>) -> Self {
        Self::with_home(address, Some(zone))
    }

    pub(crate) fn permanent(address: PhysicalAddress) -> Self {
        Self::with_home(address, None)
    }

    fn with_home(address: PhysicalAddress, home: Option<Arc<PhysicalZone>>) -> Self {
        debug_assert!(address.is_page_aligned());
        Self {
            inner: Arc::new(FrameInner { address, home }),
        }
    }

    /// Wraps a page the allocator does not manage (MMIO, firmware tables,
    /// a buffer handed over by a device).
    ///
    /// The frame is exempt from the free list: dropping it never touches any
    /// zone.
    ///
    /// # Panics
    /// If `address` is not page aligned.
    #[must_use]
    pub fn wrap_existing(address: PhysicalAddress) -> Self {
        assert!(address.is_page_aligned(), "{address:?} is not page aligned");
        Self::permanent(address)
    }

    #[inline]
    #[must_use]
    pub fn address(&self) -> PhysicalAddress {
        self.inner.address
    }

    /// Number of live handles to this frame.
    #[inline]
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    #[inline]
    #[must_use]
    pub fn is_exempt_from_free_list(&self) -> bool {
        self.inner.home.is_none()
    }

    /// Whether both handles refer to the same frame.
    #[inline]
    #[must_use]
    pub fn same_frame(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Runs `f` on the frame's bytes.
    pub fn with_bytes<M: PhysMapper, R>(&self, mapper: &M, f: impl FnOnce(&mut FrameBytes) -> R) -> R {
        // SAFETY: the frame is a whole, page-aligned page that stays allocated
        // while `self` is alive; the mapper covers all RAM by contract.
        let bytes = unsafe { mapper.phys_to_mut::<FrameBytes>(self.address()) };
        f(bytes)
    }

    pub fn zero<M: PhysMapper>(&self, mapper: &M) {
        self.with_bytes(mapper, |bytes| bytes.fill(0));
    }

    /// Copies the full contents of `source` into this frame.
    pub fn copy_from<M: PhysMapper>(&self, mapper: &M, source: &Self) {
        if self.same_frame(source) {
            return;
        }
        source.with_bytes(mapper, |src| {
            self.with_bytes(mapper, |dst| dst.copy_from_slice(src));
        });
    }

    /// # Panics
    /// If the read would run past the end of the frame.
    pub fn read_bytes<M: PhysMapper>(&self, mapper: &M, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= FRAME_BYTES, "read past end of frame");
        self.with_bytes(mapper, |bytes| {
            buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        });
    }

    /// # Panics
    /// If the write would run past the end of the frame.
    pub fn write_bytes<M: PhysMapper>(&self, mapper: &M, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= FRAME_BYTES, "write past end of frame");
        self.with_bytes(mapper, |bytes| {
            bytes[offset..offset + data.len()].copy_from_slice(data);
        });
    }
}

impl fmt::Debug for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysicalFrame({}, refs={}{})",
            self.address(),
            self.ref_count(),
            if self.is_exempt_from_free_list() { ", exempt" } else { "" }
        )
    }
}
