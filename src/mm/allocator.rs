//! Simple bump allocator for boot-time DMA pages

use crate::platform::PAGE_SIZE;

pub struct BumpAllocator {
    next: u64,
    end: u64,
    allocated: u64,
}

impl BumpAllocator {
    /// Create an allocator handing out memory from `start..start + size`.
    ///
    /// # Safety
    ///
    /// The range must be RAM that nothing else uses for the lifetime of the
    /// allocator.
    pub const unsafe fn new(start: u64, size: u64) -> Self {
        Self {
            next: start,
            end: start + size,
            allocated: 0,
        }
    }

    /// Allocate `count` contiguous pages.
    pub fn alloc_pages(&mut self, count: usize) -> Option<u64> {
        let size = (count as u64).checked_mul(PAGE_SIZE as u64)?;
        self.alloc_aligned(size, PAGE_SIZE as u64)
    }

    pub fn alloc_aligned(&mut self, size: u64, align: u64) -> Option<u64> {
        let aligned = self.next.checked_add(align - 1)? & !(align - 1);
        let new_next = aligned.checked_add(size)?;

        if new_next > self.end {
            return None;
        }

        self.next = new_next;
        self.allocated += size;
        Some(aligned)
    }

    pub fn remaining(&self) -> u64 {
        self.end - self.next
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }
}
