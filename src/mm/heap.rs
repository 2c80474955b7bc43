//! Global boot DMA heap
//!
//! A bump allocator over a fixed RAM window. The boot environment runs with
//! an identity mapping, so virtual and physical addresses are the same and
//! memory is never returned.

use core::ptr::NonNull;

use spin::Mutex;

use super::{BumpAllocator, Hal, PhysAddr};
use crate::platform::{self, PAGE_SIZE};

static HEAP: Mutex<Option<BumpAllocator>> = Mutex::new(None);

/// Initialize the global DMA heap over `start..start + size`.
///
/// # Safety
///
/// The range must be identity-mapped RAM reserved for DMA.
pub unsafe fn init(start: u64, size: u64) {
    *HEAP.lock() = Some(BumpAllocator::new(start, size));
}

/// Initialize the global DMA heap at the board's default window.
///
/// # Safety
///
/// See [`init`].
pub unsafe fn init_default() {
    init(platform::DMA_HEAP_START, platform::DMA_HEAP_SIZE);
}

/// Allocate `count` pages from the global heap
pub fn alloc_pages(count: usize) -> Option<u64> {
    HEAP.lock().as_mut().and_then(|a| a.alloc_pages(count))
}

/// Get remaining heap space
pub fn remaining() -> u64 {
    HEAP.lock().as_ref().map(|a| a.remaining()).unwrap_or(0)
}

/// [`Hal`] for the bare-metal loader: identity mapping over the global heap.
pub struct BootHal;

impl Hal for BootHal {
    fn dma_alloc(pages: usize) -> Option<(PhysAddr, NonNull<u8>)> {
        let paddr = alloc_pages(pages)?;
        let vaddr = NonNull::new(paddr as usize as *mut u8)?;
        // Bump memory may have been dirtied by whoever ran before us.
        unsafe { core::ptr::write_bytes(vaddr.as_ptr(), 0, pages * PAGE_SIZE) };
        Some((paddr, vaddr))
    }

    unsafe fn dma_dealloc(_paddr: PhysAddr, _vaddr: NonNull<u8>, _pages: usize) {}

    fn virt_to_phys(vaddr: NonNull<u8>) -> PhysAddr {
        vaddr.as_ptr() as usize as PhysAddr
    }
}
