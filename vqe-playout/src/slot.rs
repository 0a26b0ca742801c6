//! Fixed-capacity index pool for buffer handles.

use alloc::vec;
use alloc::vec::Vec;

use thiserror::Error;

use crate::error::{FatalError, PlayoutError};

/// Failure of a [`SlotAllocator`] operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlotError {
    /// Every slot is currently reserved.
    #[error("all slots are open")]
    AllSlotsOpen,
    /// The index is not currently reserved (or is out of range).
    #[error("slot {0} is not reserved")]
    NotAllocated(u32),
}

impl<E> From<SlotError> for PlayoutError<E> {
    fn from(err: SlotError) -> Self {
        match err {
            SlotError::AllSlotsOpen => PlayoutError::AllBuffersOpen,
            SlotError::NotAllocated(index) => {
                log::error!("slot {} released while free", index);
                PlayoutError::Fatal(FatalError::SlotNotAllocated(index))
            }
        }
    }
}

/// Fixed-capacity index allocator.
///
/// Tracks which of `capacity` slots are reserved with a bitmap, one bit per
/// slot. Capacity is fixed at construction; no ordering guarantee is made on
/// which free index `reserve` hands out.
pub struct SlotAllocator {
    /// Bit N of word N/32 = 1 means slot N is reserved.
    bitmap: Vec<u32>,
    capacity: u32,
    allocated: u32,
}

impl SlotAllocator {
    /// Create an allocator with `capacity` free slots.
    pub fn new(capacity: u32) -> Self {
        let words = capacity.div_ceil(32) as usize;
        SlotAllocator {
            bitmap: vec![0; words],
            capacity,
            allocated: 0,
        }
    }

    /// Reserve a free slot and return its index.
    pub fn reserve(&mut self) -> Result<u32, SlotError> {
        for (word_index, word) in self.bitmap.iter_mut().enumerate() {
            let free = !*word;
            if free == 0 {
                continue;
            }
            let slot = word_index as u32 * 32 + free.trailing_zeros();
            if slot >= self.capacity {
                break;
            }
            *word |= 1 << (slot % 32);
            self.allocated += 1;
            return Ok(slot);
        }
        Err(SlotError::AllSlotsOpen)
    }

    /// Release a previously reserved slot.
    ///
    /// Releasing a slot that is not reserved means the caller's bookkeeping is
    /// broken; it is reported as [`SlotError::NotAllocated`].
    pub fn release(&mut self, index: u32) -> Result<(), SlotError> {
        if !self.is_reserved(index) {
            return Err(SlotError::NotAllocated(index));
        }
        self.bitmap[(index / 32) as usize] &= !(1 << (index % 32));
        self.allocated -= 1;
        Ok(())
    }

    /// Whether `index` is currently reserved.
    pub fn is_reserved(&self, index: u32) -> bool {
        index < self.capacity && self.bitmap[(index / 32) as usize] & (1 << (index % 32)) != 0
    }

    /// Number of slots currently reserved.
    pub fn allocated_count(&self) -> u32 {
        self.allocated
    }

    /// Total number of slots.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}
