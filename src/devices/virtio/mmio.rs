//! Virtio-MMIO register interface (driver side).
//!
//! Typed accessors over a device's register window. Every access is a
//! single volatile load or store of a little-endian value at a fixed offset;
//! the window itself is never turned into a Rust reference.

use core::ptr::NonNull;

use bitflags::bitflags;

// ── Virtio-MMIO register offsets ────────────────────────────────────
const MAGIC_VALUE: usize = 0x000;
const VERSION: usize = 0x004;
const DEVICE_ID: usize = 0x008;
const VENDOR_ID: usize = 0x00C;
const DEVICE_FEATURES: usize = 0x010;
const DEVICE_FEATURES_SEL: usize = 0x014;
const DRIVER_FEATURES: usize = 0x020;
const DRIVER_FEATURES_SEL: usize = 0x024;
const GUEST_PAGE_SIZE: usize = 0x028; // legacy only
const QUEUE_SEL: usize = 0x030;
const QUEUE_NUM_MAX: usize = 0x034;
const QUEUE_NUM: usize = 0x038;
const QUEUE_ALIGN: usize = 0x03C; // legacy only
const QUEUE_PFN: usize = 0x040; // legacy only
const QUEUE_READY: usize = 0x044;
const QUEUE_NOTIFY: usize = 0x050;
const INTERRUPT_STATUS: usize = 0x060;
const INTERRUPT_ACK: usize = 0x064;
const STATUS: usize = 0x070;
const QUEUE_DESC_LOW: usize = 0x080;
const QUEUE_DESC_HIGH: usize = 0x084;
const QUEUE_DRIVER_LOW: usize = 0x090;
const QUEUE_DRIVER_HIGH: usize = 0x094;
const QUEUE_DEVICE_LOW: usize = 0x0A0;
const QUEUE_DEVICE_HIGH: usize = 0x0A4;
const CONFIG_SPACE: usize = 0x100;

// ── Magic and version ───────────────────────────────────────────────
pub const VIRTIO_MMIO_MAGIC: u32 = 0x74726976; // "virt"
pub const VERSION_LEGACY: u32 = 1;
pub const VERSION_MODERN: u32 = 2;

bitflags! {
    /// Device status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const DEVICE_NEEDS_RESET = 64;
        const FAILED = 128;
    }
}

bitflags! {
    /// Interrupt status / acknowledge bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptStatus: u32 {
        const USED_BUFFER = 1;
        const CONFIG_CHANGE = 2;
    }
}

/// Handle to one virtio-mmio register window.
#[derive(Clone, Copy)]
pub struct MmioRegisters {
    base: NonNull<u8>,
}

// Safety: the window is device memory reachable from every core; all
// accesses go through volatile operations.
unsafe impl Send for MmioRegisters {}
unsafe impl Sync for MmioRegisters {}

impl MmioRegisters {
    /// Wrap the register window starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a mapped virtio-mmio window (at least 0x100 bytes
    /// plus the device config space) that stays mapped while this handle or
    /// any copy of it is used.
    pub const unsafe fn new(base: NonNull<u8>) -> Self {
        Self { base }
    }

    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        let ptr = unsafe { self.base.as_ptr().add(offset) } as *const u32;
        u32::from_le(unsafe { core::ptr::read_volatile(ptr) })
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        let ptr = unsafe { self.base.as_ptr().add(offset) } as *mut u32;
        unsafe { core::ptr::write_volatile(ptr, value.to_le()) }
    }

    fn write64(&self, low: usize, high: usize, value: u64) {
        self.write32(low, value as u32);
        self.write32(high, (value >> 32) as u32);
    }

    // ── Identification ──────────────────────────────────────────────

    pub fn magic(&self) -> u32 {
        self.read32(MAGIC_VALUE)
    }

    pub fn has_valid_magic(&self) -> bool {
        self.magic() == VIRTIO_MMIO_MAGIC
    }

    pub fn version(&self) -> u32 {
        self.read32(VERSION)
    }

    pub fn device_id(&self) -> u32 {
        self.read32(DEVICE_ID)
    }

    pub fn vendor_id(&self) -> u32 {
        self.read32(VENDOR_ID)
    }

    // ── Features ────────────────────────────────────────────────────

    /// Read one 32-bit word of the device feature bits.
    pub fn device_features(&self, word: u32) -> u32 {
        self.write32(DEVICE_FEATURES_SEL, word);
        self.read32(DEVICE_FEATURES)
    }

    /// Write one 32-bit word of the driver (accepted) feature bits.
    pub fn set_driver_features(&self, word: u32, value: u32) {
        self.write32(DRIVER_FEATURES_SEL, word);
        self.write32(DRIVER_FEATURES, value);
    }

    // ── Status ──────────────────────────────────────────────────────

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.read32(STATUS))
    }

    pub fn set_status(&self, status: DeviceStatus) {
        self.write32(STATUS, status.bits());
    }

    /// OR `bits` into the status register (read-modify-write).
    pub fn add_status(&self, bits: DeviceStatus) {
        self.set_status(self.status() | bits);
    }

    /// Writing 0 to the status register resets the device.
    pub fn reset(&self) {
        self.write32(STATUS, 0);
    }

    // ── Queue setup ─────────────────────────────────────────────────

    pub fn select_queue(&self, index: u32) {
        self.write32(QUEUE_SEL, index);
    }

    pub fn queue_num_max(&self) -> u32 {
        self.read32(QUEUE_NUM_MAX)
    }

    pub fn set_queue_num(&self, num: u32) {
        self.write32(QUEUE_NUM, num);
    }

    pub fn set_guest_page_size(&self, size: u32) {
        self.write32(GUEST_PAGE_SIZE, size);
    }

    pub fn set_queue_align(&self, align: u32) {
        self.write32(QUEUE_ALIGN, align);
    }

    pub fn set_queue_pfn(&self, pfn: u32) {
        self.write32(QUEUE_PFN, pfn);
    }

    pub fn queue_ready(&self) -> bool {
        self.read32(QUEUE_READY) != 0
    }

    pub fn set_queue_ready(&self, ready: bool) {
        self.write32(QUEUE_READY, ready as u32);
    }

    pub fn set_queue_desc(&self, addr: u64) {
        self.write64(QUEUE_DESC_LOW, QUEUE_DESC_HIGH, addr);
    }

    pub fn set_queue_driver(&self, addr: u64) {
        self.write64(QUEUE_DRIVER_LOW, QUEUE_DRIVER_HIGH, addr);
    }

    pub fn set_queue_device(&self, addr: u64) {
        self.write64(QUEUE_DEVICE_LOW, QUEUE_DEVICE_HIGH, addr);
    }

    // ── Runtime ─────────────────────────────────────────────────────

    /// Ring the doorbell for `queue`.
    pub fn notify(&self, queue: u32) {
        self.write32(QUEUE_NOTIFY, queue);
    }

    pub fn interrupt_status(&self) -> InterruptStatus {
        InterruptStatus::from_bits_retain(self.read32(INTERRUPT_STATUS))
    }

    pub fn ack_interrupt(&self, bits: InterruptStatus) {
        self.write32(INTERRUPT_ACK, bits.bits());
    }

    // ── Device-specific config space ────────────────────────────────

    pub fn config_read8(&self, offset: usize) -> u8 {
        unsafe { core::ptr::read_volatile(self.base.as_ptr().add(CONFIG_SPACE + offset)) }
    }

    pub fn config_write8(&self, offset: usize, value: u8) {
        unsafe { core::ptr::write_volatile(self.base.as_ptr().add(CONFIG_SPACE + offset), value) }
    }
}

impl core::fmt::Debug for MmioRegisters {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmioRegisters")
            .field("base", &format_args!("{:#x}", self.base()))
            .finish()
    }
}
