//! Descriptor table entries and the descriptor free set.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

/// A single virtqueue descriptor, as laid out in the descriptor table.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    /// Physical address of the buffer
    pub addr: u64,
    /// Length of the buffer in bytes
    pub len: u32,
    /// Descriptor flags (NEXT, WRITE, INDIRECT)
    pub flags: u16,
    /// Index of the next descriptor in the chain (if NEXT flag set)
    pub next: u16,
}

impl Descriptor {
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_retain(self.flags)
    }

    pub fn has_next(&self) -> bool {
        self.flags().contains(DescFlags::NEXT)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// The chain continues at `next`.
        const NEXT = 1;
        /// Device writes into the buffer (driver reads it afterwards).
        const WRITE = 2;
        /// Buffer holds an indirect descriptor table. Never set by this driver.
        const INDIRECT = 4;
    }
}

const WORD_BITS: usize = u64::BITS as usize;

/// Bitmap free set over `capacity` descriptor slots; a set bit means free.
///
/// Every index is either free here or owned by exactly one in-flight chain.
#[derive(Debug)]
pub struct DescriptorAllocator {
    words: Vec<u64>,
    capacity: u16,
    free: usize,
}

impl DescriptorAllocator {
    /// All `capacity` slots start out free.
    pub fn new(capacity: u16) -> Self {
        let capacity_usize = capacity as usize;
        let mut words = vec![u64::MAX; capacity_usize.div_ceil(WORD_BITS)];
        let tail = capacity_usize % WORD_BITS;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }
        Self {
            words,
            capacity,
            free: capacity_usize,
        }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    pub fn is_free(&self, index: u16) -> bool {
        let index = index as usize;
        index < self.capacity as usize && self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Take the lowest-numbered free slot.
    pub fn allocate(&mut self) -> Option<u16> {
        let (word_idx, word) = self
            .words
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != 0)?;
        let bit = word.trailing_zeros() as usize;
        *word &= !(1 << bit);
        self.free -= 1;
        Some((word_idx * WORD_BITS + bit) as u16)
    }

    /// Take `count` slots, or none at all if fewer are free.
    pub fn allocate_chain(&mut self, count: usize) -> Option<Vec<u16>> {
        if count > self.free {
            return None;
        }
        let mut chain = Vec::with_capacity(count);
        for _ in 0..count {
            chain.push(self.allocate()?);
        }
        Some(chain)
    }

    /// Return `index` to the free set.
    ///
    /// Panics if the slot is out of range or already free: either means a
    /// chain was reaped twice or a descriptor id came from a corrupted ring.
    pub fn free(&mut self, index: u16) {
        assert!(
            index < self.capacity,
            "descriptor {} out of range (queue of {})",
            index,
            self.capacity
        );
        assert!(!self.is_free(index), "descriptor {} freed twice", index);
        let index = index as usize;
        self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        self.free += 1;
    }
}
