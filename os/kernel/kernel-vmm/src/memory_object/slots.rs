//! Resident page slots with copy-on-write marks.

use alloc::vec::Vec;
use kernel_alloc::{Bitmap, FrameAllocator, FramePolicy, OutOfMemory, PhysMapper, PhysicalFrame};

/// One optional frame per object page.
///
/// A copy-on-write mark is only ever set on a populated slot, and a populated
/// slot never empties while the object is alive.
pub(crate) struct PageSlots {
    frames: Vec<Option<PhysicalFrame>>,
    cow: Bitmap,
}

impl PageSlots {
    pub fn new(count: usize) -> Self {
        let mut frames = Vec::with_capacity(count);
        frames.resize_with(count, || None);
        Self {
            frames,
            cow: Bitmap::new(count, false),
        }
    }

    pub fn get(&self, index: usize) -> Option<&PhysicalFrame> {
        self.frames[index].as_ref()
    }

    /// Stores `frame` unless the slot was populated meanwhile; either way
    /// returns the frame that ends up in the slot.
    pub fn install(&mut self, index: usize, frame: PhysicalFrame) -> PhysicalFrame {
        self.frames[index].get_or_insert(frame).clone()
    }

    pub fn resident(&self) -> usize {
        self.frames.iter().flatten().count()
    }

    pub fn iter_resident(&self) -> impl Iterator<Item = (usize, &PhysicalFrame)> + '_ {
        self.frames
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|frame| (index, frame)))
    }

    pub fn should_cow(&self, index: usize) -> bool {
        self.cow.get(index)
    }

    pub fn is_frame_shared(&self, index: usize) -> bool {
        self.get(index).is_some_and(|frame| frame.ref_count() > 1)
    }

    /// Shares every resident frame with a fresh slot list. Both sides get the
    /// copy-on-write mark for each shared page.
    pub fn fork(&mut self) -> Self {
        let mut child = Self::new(self.frames.len());
        for (index, slot) in self.frames.iter().enumerate() {
            if let Some(frame) = slot {
                child.frames[index] = Some(frame.clone());
                child.cow.set(index, true);
                self.cow.set(index, true);
            }
        }
        child
    }

    /// Gives this side a private copy of page `index` and clears its mark.
    ///
    /// When nobody else holds the frame any more, the mark is simply dropped.
    ///
    /// # Panics
    /// If the slot is empty while marked.
    pub fn break_cow<M: PhysMapper>(
        &mut self,
        index: usize,
        frames: &FrameAllocator,
        mapper: &M,
    ) -> Result<PhysicalFrame, OutOfMemory> {
        let Some(current) = self.frames[index].as_ref() else {
            panic!("copy-on-write mark on empty slot {index}");
        };
        if !self.cow.get(index) || current.ref_count() == 1 {
            self.cow.set(index, false);
            return Ok(current.clone());
        }

        let copy = frames.allocate(FramePolicy::Any)?;
        copy.copy_from(mapper, current);
        self.frames[index] = Some(copy.clone());
        self.cow.set(index, false);
        Ok(copy)
    }
}
