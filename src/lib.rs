//! Driver side of the VirtIO split virtqueue over the MMIO transport.
//!
//! Built for the boot loader of a QEMU `virt` board (single core, polling,
//! identity-mapped DMA) but usable hosted as well; the host test harness
//! drives it against simulated devices.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod devices;
pub mod dtb;
pub mod error;
pub mod mm;
pub mod platform;
pub mod uart;

pub use devices::registry::{DeviceRegistry, MmioResource};
pub use devices::virtio::input::{InputDevice, InputEvent};
pub use devices::virtio::mmio::MmioRegisters;
pub use devices::virtio::request::{IoOp, IoRequest, IoState};
pub use devices::virtio::{Features, LifecycleStage, VirtioDevice};
pub use devices::DeviceType;
pub use error::VirtioError;
pub use mm::{BootHal, Hal, HostHal, PhysAddr};
