//! Simulated virtio-mmio device shared by the scenario tests.
//!
//! The register window is plain, page-aligned memory. The driver under test
//! writes it through `MmioRegisters`; the test plays the device by reading
//! the queue addresses back out of the window and walking the rings in the
//! (identity-mapped) host memory they point to.

#![allow(dead_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::{Mutex, OnceLock};

use virtio_boot::devices::virtio::desc::Descriptor;
use virtio_boot::mm::{BumpAllocator, Hal, PhysAddr};
use virtio_boot::{HostHal, MmioRegisters};

pub const MAGIC: u32 = 0x7472_6976;
pub const PAGE_SIZE: u64 = 4096;

const WINDOW_SIZE: usize = 4096;

const REG_MAGIC: usize = 0x000;
const REG_VERSION: usize = 0x004;
const REG_DEVICE_ID: usize = 0x008;
const REG_VENDOR_ID: usize = 0x00c;
const REG_DEVICE_FEATURES: usize = 0x010;
pub const REG_DRIVER_FEATURES: usize = 0x020;
pub const REG_GUEST_PAGE_SIZE: usize = 0x028;
const REG_QUEUE_NUM_MAX: usize = 0x034;
pub const REG_QUEUE_NUM: usize = 0x038;
pub const REG_QUEUE_ALIGN: usize = 0x03c;
pub const REG_QUEUE_PFN: usize = 0x040;
pub const REG_QUEUE_READY: usize = 0x044;
pub const REG_QUEUE_NOTIFY: usize = 0x050;
pub const REG_INTERRUPT_STATUS: usize = 0x060;
pub const REG_INTERRUPT_ACK: usize = 0x064;
pub const REG_STATUS: usize = 0x070;
const REG_QUEUE_DESC: usize = 0x080;
const REG_QUEUE_DRIVER: usize = 0x090;
const REG_QUEUE_DEVICE: usize = 0x0a0;
const CONFIG: usize = 0x100;

/// Sentinel left in the notify register until the driver rings it.
pub const NOTIFY_UNTOUCHED: u32 = 0xffff_ffff;

/// Device-side view of queue 0.
#[derive(Debug, Clone, Copy)]
pub struct Rings {
    pub len: u16,
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
}

pub struct SimDevice {
    window: NonNull<u8>,
    last_avail: std::cell::Cell<u16>,
    /// Added to a bus address to reach host memory.
    phys_offset: u64,
}

impl SimDevice {
    pub fn new(version: u32, device_id: u32, queue_num_max: u32) -> Self {
        let layout = Self::layout();
        let window = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("window allocation");
        let sim = Self {
            window,
            last_avail: std::cell::Cell::new(0),
            phys_offset: 0,
        };
        sim.write_reg(REG_MAGIC, MAGIC);
        sim.write_reg(REG_VERSION, version);
        sim.write_reg(REG_DEVICE_ID, device_id);
        sim.write_reg(REG_VENDOR_ID, 0x554d_4551);
        sim.write_reg(REG_DEVICE_FEATURES, 0);
        sim.write_reg(REG_QUEUE_NUM_MAX, queue_num_max);
        sim.write_reg(REG_QUEUE_NOTIFY, NOTIFY_UNTOUCHED);
        sim
    }

    pub fn legacy(device_id: u32, queue_num_max: u32) -> Self {
        Self::new(1, device_id, queue_num_max)
    }

    pub fn modern(device_id: u32, queue_num_max: u32) -> Self {
        Self::new(2, device_id, queue_num_max)
    }

    /// Translate bus addresses the way [`LowHal`] hands them out.
    pub fn behind_low_hal(mut self) -> Self {
        self.phys_offset = LowHal::offset();
        self
    }

    pub fn to_host(&self, phys: u64) -> u64 {
        phys.wrapping_add(self.phys_offset)
    }

    fn layout() -> Layout {
        Layout::from_size_align(WINDOW_SIZE, 4096).expect("window layout")
    }

    pub fn base(&self) -> NonNull<u8> {
        self.window
    }

    pub fn addr(&self) -> u64 {
        self.window.as_ptr() as u64
    }

    pub fn registers(&self) -> MmioRegisters {
        unsafe { MmioRegisters::new(self.window) }
    }

    pub fn read_reg(&self, offset: usize) -> u32 {
        let ptr = unsafe { self.window.as_ptr().add(offset) } as *const u32;
        u32::from_le(unsafe { ptr.read_volatile() })
    }

    pub fn write_reg(&self, offset: usize, value: u32) {
        let ptr = unsafe { self.window.as_ptr().add(offset) } as *mut u32;
        unsafe { ptr.write_volatile(value.to_le()) }
    }

    pub fn set_features(&self, word0: u32) {
        self.write_reg(REG_DEVICE_FEATURES, word0);
    }

    pub fn set_config(&self, offset: usize, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            unsafe { self.window.as_ptr().add(CONFIG + offset + i).write_volatile(b) };
        }
    }

    pub fn status(&self) -> u32 {
        self.read_reg(REG_STATUS)
    }

    fn read_reg64(&self, low: usize) -> u64 {
        self.read_reg(low) as u64 | (self.read_reg(low + 4) as u64) << 32
    }

    /// Queue 0 as configured by the driver, in host addresses.
    pub fn rings(&self) -> Rings {
        let bus = self.bus_rings();
        Rings {
            len: bus.len,
            desc: self.to_host(bus.desc),
            avail: self.to_host(bus.avail),
            used: self.to_host(bus.used),
        }
    }

    /// Queue 0 as configured by the driver, in bus addresses.
    pub fn bus_rings(&self) -> Rings {
        let len = self.read_reg(REG_QUEUE_NUM) as u16;
        if self.read_reg(REG_VERSION) == 1 {
            let desc = self.read_reg(REG_QUEUE_PFN) as u64 * PAGE_SIZE;
            let avail = desc + 16 * len as u64;
            let align = self.read_reg(REG_QUEUE_ALIGN) as u64;
            let used = (avail + 6 + 2 * len as u64).div_ceil(align) * align;
            Rings { len, desc, avail, used }
        } else {
            Rings {
                len,
                desc: self.read_reg64(REG_QUEUE_DESC),
                avail: self.read_reg64(REG_QUEUE_DRIVER),
                used: self.read_reg64(REG_QUEUE_DEVICE),
            }
        }
    }

    // ── Device side of the rings ────────────────────────────────────

    pub fn avail_idx(&self) -> u16 {
        read16(self.rings().avail + 2)
    }

    pub fn used_idx(&self) -> u16 {
        read16(self.rings().used + 2)
    }

    pub fn descriptor(&self, index: u16) -> Descriptor {
        let rings = self.rings();
        let raw = unsafe { ((rings.desc + 16 * index as u64) as *const Descriptor).read_volatile() };
        Descriptor {
            addr: u64::from_le(raw.addr),
            len: u32::from_le(raw.len),
            flags: u16::from_le(raw.flags),
            next: u16::from_le(raw.next),
        }
    }

    /// Descriptors of the chain starting at `head`, in order.
    pub fn chain(&self, head: u16) -> Vec<Descriptor> {
        let mut chain = Vec::new();
        let mut index = head;
        loop {
            let desc = self.descriptor(index);
            chain.push(desc);
            if !desc.has_next() {
                return chain;
            }
            assert!(chain.len() <= self.rings().len as usize, "looping chain");
            index = desc.next;
        }
    }

    /// Next chain head the driver published, if any.
    pub fn pop_avail(&self) -> Option<u16> {
        let rings = self.rings();
        let next = self.last_avail.get();
        if read16(rings.avail + 2) == next {
            return None;
        }
        let slot = (next % rings.len) as u64;
        self.last_avail.set(next.wrapping_add(1));
        Some(read16(rings.avail + 4 + 2 * slot))
    }

    /// Return `id` to the driver with `len` bytes written.
    pub fn push_used(&self, id: u16, len: u32) {
        let rings = self.rings();
        let idx = read16(rings.used + 2);
        let elem = rings.used + 4 + 8 * (idx % rings.len) as u64;
        write32(elem, id as u32);
        write32(elem + 4, len);
        write16(rings.used + 2, idx.wrapping_add(1));
    }

    /// Complete the next published chain; returns its head.
    pub fn complete_next(&self, len: u32) -> Option<u16> {
        let head = self.pop_avail()?;
        self.push_used(head, len);
        Some(head)
    }

    /// Copy `bytes` into the buffer of descriptor `index`.
    pub fn fill_buffer(&self, index: u16, bytes: &[u8]) {
        let desc = self.descriptor(index);
        assert!(bytes.len() <= desc.len as usize);
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.to_host(desc.addr) as *mut u8,
                bytes.len(),
            );
        }
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        unsafe { dealloc(self.window.as_ptr(), Self::layout()) };
    }
}

fn read16(addr: u64) -> u16 {
    u16::from_le(unsafe { (addr as *const u16).read_volatile() })
}

fn write16(addr: u64, value: u16) {
    unsafe { (addr as *mut u16).write_volatile(value.to_le()) }
}

fn write32(addr: u64, value: u32) {
    unsafe { (addr as *mut u32).write_volatile(value.to_le()) }
}

// ── Low bus addresses for legacy devices ─────────────────────────────

/// Bus address the [`LowHal`] arena starts at.
pub const LOW_BUS_BASE: u64 = 0x4000_0000;
const ARENA_PAGES: usize = 512;

struct Arena {
    host_base: u64,
    pages: Mutex<BumpAllocator>,
}

fn arena() -> &'static Arena {
    static ARENA: OnceLock<Arena> = OnceLock::new();
    ARENA.get_or_init(|| {
        let layout = Layout::from_size_align(ARENA_PAGES * PAGE_SIZE as usize, PAGE_SIZE as usize)
            .expect("arena layout");
        let host_base = unsafe { alloc_zeroed(layout) } as u64;
        assert_ne!(host_base, 0, "arena allocation");
        Arena {
            host_base,
            pages: Mutex::new(unsafe {
                BumpAllocator::new(host_base, (ARENA_PAGES as u64) * PAGE_SIZE)
            }),
        }
    })
}

/// [`Hal`] whose bus addresses start at [`LOW_BUS_BASE`], so a legacy
/// device's 32-bit page frame number can reach queue memory. Every host
/// address is shifted by the same offset; buffers outside the arena
/// translate too.
pub struct LowHal;

impl LowHal {
    pub fn offset() -> u64 {
        arena().host_base.wrapping_sub(LOW_BUS_BASE)
    }
}

impl Hal for LowHal {
    fn dma_alloc(pages: usize) -> Option<(PhysAddr, NonNull<u8>)> {
        let host = arena().pages.lock().ok()?.alloc_pages(pages)?;
        let vaddr = NonNull::new(host as *mut u8)?;
        unsafe { std::ptr::write_bytes(vaddr.as_ptr(), 0, pages * PAGE_SIZE as usize) };
        Some((Self::virt_to_phys(vaddr), vaddr))
    }

    unsafe fn dma_dealloc(_paddr: PhysAddr, _vaddr: NonNull<u8>, _pages: usize) {}

    fn virt_to_phys(vaddr: NonNull<u8>) -> PhysAddr {
        (vaddr.as_ptr() as u64).wrapping_sub(Self::offset())
    }
}

/// Bus addresses start at 2^44, so a queue page frame number never fits
/// in 32 bits. Memory comes from [`HostHal`]; only the reported address moves.
pub struct HighHal;

pub const HIGH_BUS_OFFSET: u64 = 1 << 44;

impl Hal for HighHal {
    fn dma_alloc(pages: usize) -> Option<(PhysAddr, NonNull<u8>)> {
        let (_, vaddr) = HostHal::dma_alloc(pages)?;
        Some((Self::virt_to_phys(vaddr), vaddr))
    }

    unsafe fn dma_dealloc(paddr: PhysAddr, vaddr: NonNull<u8>, pages: usize) {
        unsafe { HostHal::dma_dealloc(paddr, vaddr, pages) }
    }

    fn virt_to_phys(vaddr: NonNull<u8>) -> PhysAddr {
        (vaddr.as_ptr() as u64).wrapping_add(HIGH_BUS_OFFSET)
    }
}
