//! [`Hal`] backed by the global allocator
//!
//! For hosted builds (and the test suite) where "physical" memory is just the
//! process heap: addresses are reported unchanged, which is what a simulated
//! device sharing the address space expects.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::ptr::NonNull;

use super::{Hal, PhysAddr};
use crate::platform::PAGE_SIZE;

pub struct HostHal;

impl HostHal {
    fn layout(pages: usize) -> Option<Layout> {
        Layout::from_size_align(pages.checked_mul(PAGE_SIZE)?, PAGE_SIZE).ok()
    }
}

impl Hal for HostHal {
    fn dma_alloc(pages: usize) -> Option<(PhysAddr, NonNull<u8>)> {
        if pages == 0 {
            return None;
        }
        let layout = Self::layout(pages)?;
        let vaddr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        Some((Self::virt_to_phys(vaddr), vaddr))
    }

    unsafe fn dma_dealloc(_paddr: PhysAddr, vaddr: NonNull<u8>, pages: usize) {
        if let Some(layout) = Self::layout(pages) {
            dealloc(vaddr.as_ptr(), layout);
        }
    }

    fn virt_to_phys(vaddr: NonNull<u8>) -> PhysAddr {
        vaddr.as_ptr() as usize as PhysAddr
    }
}
