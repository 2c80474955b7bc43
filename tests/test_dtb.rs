//! Device-tree discovery: `virtio,mmio` nodes end up in the registry with
//! their window and interrupt.

mod common;

use common::*;
use fdt::Fdt;
use virtio_boot::dtb::{self, FDT_MAGIC};
use virtio_boot::{DeviceRegistry, DeviceType, VirtioError};

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;

/// Minimal flattened device tree writer (version 17, no reservations).
#[derive(Default)]
struct FdtBuilder {
    structs: Vec<u8>,
    strings: Vec<u8>,
}

impl FdtBuilder {
    fn token(&mut self, token: u32) {
        self.structs.extend_from_slice(&token.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structs.len() % 4 != 0 {
            self.structs.push(0);
        }
    }

    fn begin_node(&mut self, name: &str) -> &mut Self {
        self.token(FDT_BEGIN_NODE);
        self.structs.extend_from_slice(name.as_bytes());
        self.structs.push(0);
        self.pad();
        self
    }

    fn end_node(&mut self) -> &mut Self {
        self.token(FDT_END_NODE);
        self
    }

    fn prop(&mut self, name: &str, value: &[u8]) -> &mut Self {
        let name_off = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);

        self.token(FDT_PROP);
        self.structs.extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.structs.extend_from_slice(&name_off.to_be_bytes());
        self.structs.extend_from_slice(value);
        self.pad();
        self
    }

    fn prop_cells(&mut self, name: &str, cells: &[u32]) -> &mut Self {
        let value: Vec<u8> = cells.iter().flat_map(|c| c.to_be_bytes()).collect();
        self.prop(name, &value)
    }

    fn prop_str(&mut self, name: &str, value: &str) -> &mut Self {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.prop(name, &bytes)
    }

    /// Serialize into 8-byte aligned storage.
    fn finish(mut self) -> Vec<u64> {
        self.token(FDT_END);

        let header_len = 40;
        let rsvmap_off = header_len;
        let struct_off = rsvmap_off + 16;
        let strings_off = struct_off + self.structs.len();
        let total = strings_off + self.strings.len();

        let header = [
            FDT_MAGIC,
            total as u32,
            struct_off as u32,
            strings_off as u32,
            rsvmap_off as u32,
            17,
            16,
            0,
            self.strings.len() as u32,
            self.structs.len() as u32,
        ];
        let mut blob: Vec<u8> = header.iter().flat_map(|w| w.to_be_bytes()).collect();
        blob.extend_from_slice(&[0; 16]);
        blob.extend_from_slice(&self.structs);
        blob.extend_from_slice(&self.strings);

        let mut words = vec![0u64; blob.len().div_ceil(8)];
        unsafe {
            std::ptr::copy_nonoverlapping(blob.as_ptr(), words.as_mut_ptr() as *mut u8, blob.len());
        }
        words
    }
}

fn as_bytes(words: &[u64]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(words.as_ptr() as *const u8, words.len() * 8) }
}

fn virtio_node(b: &mut FdtBuilder, base: u64, size: u64, interrupts: &[u32]) {
    b.begin_node(&format!("virtio_mmio@{:x}", base))
        .prop_str("compatible", "virtio,mmio")
        .prop_cells(
            "reg",
            &[(base >> 32) as u32, base as u32, (size >> 32) as u32, size as u32],
        )
        .prop_cells("interrupts", interrupts)
        .end_node();
}

/// Root with 2/2 cells, a UART and one node per `(sim, interrupts)`.
fn board(devices: &[(&SimDevice, &[u32])]) -> Vec<u64> {
    let mut b = FdtBuilder::default();
    b.begin_node("")
        .prop_cells("#address-cells", &[2])
        .prop_cells("#size-cells", &[2])
        .prop_str("compatible", "linux,dummy-virt");
    b.begin_node("pl011@9000000")
        .prop("compatible", b"arm,pl011\0arm,primecell\0")
        .prop_cells("reg", &[0, 0x0900_0000, 0, 0x1000])
        .end_node();
    for (sim, irq) in devices {
        virtio_node(&mut b, sim.addr(), 0x200, irq);
    }
    b.end_node();
    b.finish()
}

#[test]
fn registers_every_virtio_node() {
    let net = SimDevice::modern(1, 8);
    let kbd = SimDevice::modern(18, 8);
    let blob = board(&[(&net, &[0, 16, 1][..]), (&kbd, &[0, 17, 1][..])]);

    let fdt = Fdt::new(as_bytes(&blob)).unwrap();
    let mut registry = DeviceRegistry::new();
    let count = unsafe { dtb::register_from_fdt(&fdt, &mut registry) };

    assert_eq!(count, 2);
    assert_eq!(registry.len(), 2);

    let found = registry.find(DeviceType::Input, 0).unwrap();
    assert_eq!(found.base() as u64, kbd.addr());
    assert_eq!(found.len(), 0x200);
    assert_eq!(found.irq(), 49);

    let found = registry.find(DeviceType::Network, 0).unwrap();
    assert_eq!(found.irq(), 48);
}

#[test]
fn single_cell_interrupts_are_taken_as_is() {
    let sim = SimDevice::modern(4, 8);
    let blob = board(&[(&sim, &[7][..])]);

    let mut registry = DeviceRegistry::new();
    let count = unsafe { dtb::scan(blob.as_ptr() as usize, &mut registry) }.unwrap();
    assert_eq!(count, 1);
    assert_eq!(registry.find(DeviceType::Entropy, 0).unwrap().irq(), 7);
}

#[test]
fn ppi_specifier_maps_to_intid() {
    let sim = SimDevice::modern(4, 8);
    let blob = board(&[(&sim, &[1, 3, 4][..])]);

    let mut registry = DeviceRegistry::new();
    unsafe { dtb::scan(blob.as_ptr() as usize, &mut registry) }.unwrap();
    assert_eq!(registry.iter().next().unwrap().irq(), 19);
}

#[test]
fn oversized_interrupt_number_is_dropped() {
    let spi = SimDevice::modern(4, 8);
    let ppi = SimDevice::modern(4, 8);
    let blob = board(&[
        (&spi, &[0, u32::MAX, 4][..]),
        (&ppi, &[1, u32::MAX - 15, 4][..]),
    ]);

    let mut registry = DeviceRegistry::new();
    let count = unsafe { dtb::scan(blob.as_ptr() as usize, &mut registry) }.unwrap();
    assert_eq!(count, 2);
    for res in registry.iter() {
        assert_eq!(res.irq(), 0);
        assert_eq!(res.len(), 0x200);
    }
    assert_eq!(registry.find(DeviceType::Entropy, 1).unwrap().base() as u64, ppi.addr());
}

#[test]
fn board_without_virtio_registers_nothing() {
    let blob = board(&[]);
    let mut registry = DeviceRegistry::new();
    assert_eq!(unsafe { dtb::scan(blob.as_ptr() as usize, &mut registry) }, Ok(0));
    assert!(registry.is_empty());
}

#[test]
fn corrupt_blob_is_rejected() {
    let mut blob = board(&[]);
    blob[0] = 0;
    let mut registry = DeviceRegistry::new();
    assert_eq!(
        unsafe { dtb::scan(blob.as_ptr() as usize, &mut registry) },
        Err(VirtioError::InvalidDeviceTree)
    );
}
