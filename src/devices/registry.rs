//! Registry of candidate VirtIO MMIO windows.
//!
//! Registration only records where a device might live; nothing is
//! initialized until a driver looks the device up with [`DeviceRegistry::find`].

use alloc::vec::Vec;
use core::ptr::NonNull;

use log::{trace, warn};

use super::virtio::mmio::MmioRegisters;
use super::DeviceType;
use crate::error::VirtioError;
use crate::platform::MAX_VIRTIO_DEVICES;

/// One registered MMIO window.
#[derive(Debug, Clone, Copy)]
pub struct MmioResource {
    regs: MmioRegisters,
    len: usize,
    irq: u32,
}

impl MmioResource {
    pub fn base(&self) -> usize {
        self.regs.base()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn registers(&self) -> MmioRegisters {
        self.regs
    }
}

/// Fixed-capacity list of candidate windows, in registration order.
#[derive(Debug)]
pub struct DeviceRegistry {
    resources: Vec<MmioResource>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            resources: Vec::with_capacity(MAX_VIRTIO_DEVICES),
        }
    }

    /// Record a candidate window.
    ///
    /// Once [`MAX_VIRTIO_DEVICES`] windows are known further candidates are
    /// dropped with a warning; the returned `RegistryFull` may be ignored.
    ///
    /// # Safety
    ///
    /// `base..base + len` must be a mapped VirtIO MMIO window that stays
    /// mapped for as long as the registry or anything it hands out is used.
    pub unsafe fn register(
        &mut self,
        base: NonNull<u8>,
        len: usize,
        irq: u32,
    ) -> Result<(), VirtioError> {
        if self.resources.len() >= MAX_VIRTIO_DEVICES {
            warn!("virtio: registry full, dropping window at {:p}", base);
            return Err(VirtioError::RegistryFull);
        }
        let regs = unsafe { MmioRegisters::new(base) };
        trace!(
            "virtio@{:#x}: signature {:#010x}, version {}, device id {}, vendor {:#x}, irq {}",
            regs.base(),
            regs.magic(),
            regs.version(),
            regs.device_id(),
            regs.vendor_id(),
            irq
        );
        self.resources.push(MmioResource { regs, len, irq });
        Ok(())
    }

    /// The `n`-th (from 0) registered window hosting a `device_type` device.
    pub fn find(&self, device_type: DeviceType, n: usize) -> Option<&MmioResource> {
        self.find_by_id(device_type.id(), n)
    }

    /// Like [`find`](Self::find), with a raw device id.
    pub fn find_by_id(&self, device_id: u32, n: usize) -> Option<&MmioResource> {
        self.resources
            .iter()
            .filter(|res| {
                let regs = res.registers();
                regs.has_valid_magic() && regs.device_id() == device_id
            })
            .nth(n)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MmioResource> {
        self.resources.iter()
    }

    /// Reset every registered device a driver has touched, so none of them
    /// keeps running (or raising interrupts) after control is handed on.
    ///
    /// Windows still at status 0 were never brought up and are left alone,
    /// as are windows without a VirtIO signature. Returns how many devices
    /// were reset.
    pub fn reset_all(&self) -> usize {
        let mut count = 0;
        for res in self.resources.iter() {
            let regs = res.registers();
            if !regs.has_valid_magic() || regs.status().is_empty() {
                continue;
            }
            regs.reset();
            count += 1;
            trace!("virtio@{:#x}: reset", regs.base());
        }
        count
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
