//! VirtIO MMIO discovery from a flattened device tree
//!
//! The loader is handed a DTB describing the board. Every node compatible
//! with `virtio,mmio` is a candidate window; its first `reg` entry and its
//! interrupt are recorded in a [`DeviceRegistry`].
//!
//! The `fdt` crate does zero-copy parsing, so no heap is needed here beyond
//! what the registry itself uses.

use core::ptr::NonNull;

use fdt::node::FdtNode;
use fdt::Fdt;
use log::{debug, warn};

use crate::devices::registry::DeviceRegistry;
use crate::error::VirtioError;
use crate::platform::VIRTIO_MMIO_SIZE;

/// FDT header magic (big-endian in memory).
pub const FDT_MAGIC: u32 = 0xD00D_FEED;

const VIRTIO_MMIO_COMPATIBLE: &str = "virtio,mmio";

/// GIC interrupt specifier types.
const GIC_SPI: u32 = 0;
const GIC_PPI: u32 = 1;

/// Check the FDT magic at `addr`.
fn has_fdt_magic(addr: usize) -> bool {
    if addr == 0 {
        return false;
    }
    let magic = unsafe { core::ptr::read_volatile(addr as *const u32) };
    u32::from_be(magic) == FDT_MAGIC
}

/// Parse the DTB at `dtb_addr` and register every VirtIO MMIO window in it.
///
/// Returns the number of windows registered.
///
/// # Safety
///
/// `dtb_addr` must point to readable memory holding the DTB, and the
/// windows it describes must be mapped (see [`DeviceRegistry::register`]).
pub unsafe fn scan(dtb_addr: usize, registry: &mut DeviceRegistry) -> Result<usize, VirtioError> {
    if !has_fdt_magic(dtb_addr) {
        warn!("dtb: no device tree at {:#x}", dtb_addr);
        return Err(VirtioError::InvalidDeviceTree);
    }
    let fdt = unsafe { Fdt::from_ptr(dtb_addr as *const u8) }
        .map_err(|_| VirtioError::InvalidDeviceTree)?;
    Ok(unsafe { register_from_fdt(&fdt, registry) })
}

/// Register every `virtio,mmio` node of `fdt` with `registry`.
///
/// Nodes without a usable `reg` entry are skipped. Returns the number of
/// windows registered; a full registry stops counting but not scanning.
///
/// # Safety
///
/// The addresses in `fdt` are trusted to be mapped VirtIO MMIO windows.
pub unsafe fn register_from_fdt(fdt: &Fdt<'_>, registry: &mut DeviceRegistry) -> usize {
    let mut registered = 0;
    for node in fdt.all_nodes() {
        let is_virtio = node
            .compatible()
            .is_some_and(|compat| compat.all().any(|c| c == VIRTIO_MMIO_COMPATIBLE));
        if !is_virtio {
            continue;
        }

        let Some(region) = node.reg().and_then(|mut regs| regs.next()) else {
            warn!("dtb: {} has no reg property", node.name);
            continue;
        };
        let Some(base) = NonNull::new(region.starting_address as *mut u8) else {
            warn!("dtb: {} has a null base address", node.name);
            continue;
        };
        let len = region.size.unwrap_or(VIRTIO_MMIO_SIZE);
        let irq = interrupt_of(&node).unwrap_or(0);

        debug!("dtb: {} at {:p} (+{:#x}), irq {}", node.name, base, len, irq);
        if unsafe { registry.register(base, len, irq) }.is_ok() {
            registered += 1;
        }
    }
    registered
}

/// Interrupt number from a node's raw `interrupts` property.
///
/// A single cell is taken as is. A three-cell GIC specifier
/// `<type number flags>` becomes the GIC INTID (SPIs start at 32, PPIs at 16);
/// a number too large for that yields `None`.
fn interrupt_of(node: &FdtNode<'_, '_>) -> Option<u32> {
    let prop = node.property("interrupts")?;
    let cells: [Option<u32>; 3] = core::array::from_fn(|i| {
        prop.value
            .get(i * 4..i * 4 + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    });
    match (prop.value.len() / 4, cells) {
        (1, [Some(irq), ..]) => Some(irq),
        (3, [Some(GIC_SPI), Some(num), _]) => num.checked_add(32),
        (3, [Some(GIC_PPI), Some(num), _]) => num.checked_add(16),
        (_, [Some(irq), ..]) => Some(irq),
        _ => None,
    }
}
