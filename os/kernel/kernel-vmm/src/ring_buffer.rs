//! A byte ring in physically contiguous memory.
//!
//! Producers append chunks and hand their physical address to a device.
//! Once the device is done with a chunk it is reclaimed, strictly in the
//! order chunks were written. A chunk never crosses the wrap point, so the
//! device always sees one contiguous physical run.

use crate::error::VmError;
use crate::memory_object::{ContiguousObject, MemoryObject};
use crate::region::Access;
use crate::vmm::{Platform, Vmm};
use alloc::sync::Arc;
use kernel_alloc::{FRAME_BYTES, FramePolicy};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualRange, align_up};
use kernel_sync::SpinLock;
use kernel_vmem::Processor;
use log::{debug, warn};

pub struct PhysicalRingBuffer<'a, P: Platform> {
    vmm: &'a Vmm<P>,
    mapping: VirtualRange,
    base: PhysicalAddress,
    capacity: usize,
    used: SpinLock<UsedExtent>,
}

/// Offsets are relative to the start of the buffer.
#[derive(Debug, Default)]
struct UsedExtent {
    start: usize,
    len: usize,
}

impl<'a, P: Platform> PhysicalRingBuffer<'a, P> {
    /// Allocates `capacity` bytes (rounded up to pages for the allocation)
    /// and maps them into the kernel space.
    ///
    /// # Errors
    /// - [`VmError::InvalidRange`] for a zero capacity.
    /// - [`VmError::OutOfMemory`] without a long enough physical run.
    /// - [`VmError::NoSpace`] if the kernel window is full.
    pub fn new(vmm: &'a Vmm<P>, capacity: usize) -> Result<Self, VmError> {
        let size = align_up(capacity as u64, PAGE_SIZE);
        let object = MemoryObject::contiguous(vmm.frames(), vmm.platform(), size, FramePolicy::Any)?;
        let base = object
            .as_contiguous()
            .map(ContiguousObject::base)
            .ok_or(VmError::InvalidRegion)?;
        let mapping = vmm
            .kernel_space()
            .allocate_region(vmm, None, size, Arc::clone(&object), 0, Access::READ_WRITE)?;
        debug!("Ring buffer of {capacity} bytes at {base} mapped at {mapping}");

        Ok(Self {
            vmm,
            mapping,
            base,
            capacity,
            used: SpinLock::new(UsedExtent::default()),
        })
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Kernel virtual range the buffer is mapped at.
    #[inline]
    #[must_use]
    pub const fn mapping(&self) -> VirtualRange {
        self.mapping
    }

    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.used.lock().len
    }

    /// Physical address of the oldest unreclaimed byte.
    #[must_use]
    pub fn start_of_used(&self) -> PhysicalAddress {
        self.physical_address(self.used.lock().start)
    }

    fn physical_address(&self, offset: usize) -> PhysicalAddress {
        self.base + offset as u64
    }

    /// Appends as much of `data` as fits before the wrap point and the
    /// capacity limit.
    ///
    /// Returns the chunk's physical address and length, or `None` if not a
    /// single byte fits.
    pub fn write(&self, data: &[u8]) -> Option<(PhysicalAddress, usize)> {
        let mut used = self.used.lock();
        let start_of_free = (used.start + used.len) % self.capacity;
        let room = (self.capacity - used.len).min(self.capacity - start_of_free);
        let len = data.len().min(room);
        if len == 0 {
            return None;
        }

        self.copy_chunks(start_of_free, len, |ptr, done, chunk| {
            // SAFETY: `ptr` addresses `chunk` bytes of this buffer's mapping.
            unsafe { core::ptr::copy_nonoverlapping(data[done..].as_ptr(), ptr, chunk) };
        });
        used.len += len;
        Some((self.physical_address(start_of_free), len))
    }

    /// Copies from the start of the used extent up to the wrap point without
    /// reclaiming anything.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let used = self.used.lock();
        let len = buf.len().min(used.len).min(self.capacity - used.start);
        self.copy_chunks(used.start, len, |ptr, done, chunk| {
            // SAFETY: `ptr` addresses `chunk` bytes of this buffer's mapping.
            unsafe { core::ptr::copy_nonoverlapping(ptr, buf[done..].as_mut_ptr(), chunk) };
        });
        len
    }

    /// Gives back the oldest chunk.
    ///
    /// # Panics
    /// If `chunk_start` is not the start of the used extent or `chunk_size`
    /// exceeds what is in use.
    pub fn reclaim(&self, chunk_start: PhysicalAddress, chunk_size: usize) {
        let mut used = self.used.lock();
        assert_eq!(
            chunk_start,
            self.physical_address(used.start),
            "chunks must be reclaimed in the order they were written"
        );
        assert!(
            chunk_size <= used.len,
            "reclaiming {chunk_size} bytes with only {} in use",
            used.len
        );
        used.start = (used.start + chunk_size) % self.capacity;
        used.len -= chunk_size;
    }

    /// Calls `f(pointer, bytes_done, chunk_len)` for each page-sized piece
    /// of `[offset, offset + len)`.
    #[allow(clippy::cast_possible_truncation)]
    fn copy_chunks(&self, offset: usize, len: usize, mut f: impl FnMut(*mut u8, usize, usize)) {
        let mut done = 0;
        while done < len {
            let va = self.mapping.base() + (offset + done) as u64;
            let chunk = (len - done).min(FRAME_BYTES - va.page_offset() as usize);
            f(self.vmm.platform().pointer_to(va), done, chunk);
            done += chunk;
        }
    }
}

impl<P: Platform> Drop for PhysicalRingBuffer<'_, P> {
    fn drop(&mut self) {
        if let Err(e) = self.vmm.kernel_space().remove_region(self.vmm, self.mapping) {
            warn!("Unmapping ring buffer at {}: {e}", self.mapping);
        }
    }
}
