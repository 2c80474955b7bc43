//! DMA memory for virtqueues and request buffers
//!
//! The queue engine never allocates device-visible memory itself. It asks a
//! [`Hal`] implementation for zeroed, page-aligned regions and for the
//! physical address of buffers it hands to the device.

pub mod allocator;
pub mod heap;
pub mod host;

use core::ptr::NonNull;

pub use allocator::BumpAllocator;
pub use heap::BootHal;
pub use host::HostHal;

/// Physical (bus) address as seen by the device.
pub type PhysAddr = u64;

/// Memory services the VirtIO engine consumes.
///
/// Implementations are stateless types; any backing state is global, so a
/// device can be generic over its HAL without storing one.
pub trait Hal {
    /// Allocate `pages` contiguous, page-aligned, zeroed pages.
    ///
    /// Returns the physical address and the virtual pointer of the region,
    /// or `None` when memory is exhausted.
    fn dma_alloc(pages: usize) -> Option<(PhysAddr, NonNull<u8>)>;

    /// Release a region obtained from [`Hal::dma_alloc`].
    ///
    /// # Safety
    ///
    /// `paddr`/`vaddr`/`pages` must describe exactly one live allocation and
    /// the device must no longer access it.
    unsafe fn dma_dealloc(paddr: PhysAddr, vaddr: NonNull<u8>, pages: usize);

    /// Translate a driver-visible pointer into the address the device uses.
    fn virt_to_phys(vaddr: NonNull<u8>) -> PhysAddr;
}

