//! Platform/Board Constants (QEMU virt machine)
//!
//! All board-specific addresses and sizes live here so they can be
//! changed in one place when targeting a different platform.

// ── Memory ───────────────────────────────────────────────────────────
/// Page granule used for queue memory and the legacy PFN register.
pub const PAGE_SIZE: usize = 4096;

// ── UART (PL011) ─────────────────────────────────────────────────────
pub const UART_BASE: usize = 0x0900_0000;

// ── VirtIO MMIO ──────────────────────────────────────────────────────
/// Size of one virtio-mmio register window on QEMU virt, used when the
/// device tree omits it.
pub const VIRTIO_MMIO_SIZE: usize = 0x200;
/// Maximum number of transports the registry records.
pub const MAX_VIRTIO_DEVICES: usize = 32;
/// Event buffers kept posted on the boot keyboard.
pub const INPUT_EVENT_BUFFERS: usize = 4;

// ── DMA heap (boot) ──────────────────────────────────────────────────
pub const DMA_HEAP_START: u64 = 0x4100_0000;
pub const DMA_HEAP_SIZE: u64 = 0x10_0000; // 1MB
