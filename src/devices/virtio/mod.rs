//! VirtIO over MMIO, driver side.
//!
//! [`VirtioDevice`] brings a device from reset to `DRIVER_OK` with a single
//! split virtqueue (queue 0) and exposes submission and completion on it.
//! The queue state sits behind a spin lock, so a device can be shared
//! between threads by reference.

pub mod desc;
pub mod input;
pub mod layout;
pub mod mmio;
pub mod queue;
pub mod request;

use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{fence, Ordering};

use bitflags::bitflags;
use log::{debug, trace, warn};
use spin::Mutex;

use crate::devices::DeviceType;
use crate::error::VirtioError;
use crate::mm::Hal;
use crate::platform::PAGE_SIZE;
use mmio::{DeviceStatus, InterruptStatus, MmioRegisters, VERSION_LEGACY, VERSION_MODERN};
use queue::SplitQueue;
use request::IoRequest;

bitflags! {
    /// Device-independent feature bits (device-specific bits are 0..=23).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u64 {
        const NOTIFY_ON_EMPTY = 1 << 24;
        const ANY_LAYOUT = 1 << 27;
        const RING_INDIRECT_DESC = 1 << 28;
        const RING_EVENT_IDX = 1 << 29;
        const BAD_FEATURE = 1 << 30;
        const VERSION_1 = 1 << 32;
        const ACCESS_PLATFORM = 1 << 33;
        const RING_PACKED = 1 << 34;
    }
}

/// Bits 0..=27 of the first feature word: device-specific bits plus the
/// transport bits the driver is happy to accept as offered.
pub const TRANSPORT_MASK: u64 = (1 << 28) - 1;

/// Feature bits the driver accepts from word 0.
pub const ACCEPTED_FEATURES: u64 =
    TRANSPORT_MASK | Features::RING_INDIRECT_DESC.bits() | Features::RING_EVENT_IDX.bits();

impl Features {
    /// Fold `bits` into named flags for a diagnostic dump; unnamed bits are
    /// reported separately.
    pub fn describe(bits: u64) -> FeatureDump {
        FeatureDump(bits)
    }
}

/// `Display` adapter listing feature names, e.g. `VERSION_1 | bit 5`.
pub struct FeatureDump(u64);

impl fmt::Display for FeatureDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let known = Features::from_bits_truncate(self.0);
        let mut first = true;
        for (name, _) in known.iter_names() {
            if !first {
                f.write_str(" | ")?;
            }
            f.write_str(name)?;
            first = false;
        }
        let mut rest = self.0 & !known.bits();
        while rest != 0 {
            let bit = rest.trailing_zeros();
            if !first {
                f.write_str(" | ")?;
            }
            write!(f, "bit {}", bit)?;
            first = false;
            rest &= rest - 1;
        }
        if first {
            f.write_str("(none)")?;
        }
        Ok(())
    }
}

/// Steps of device bring-up, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleStage {
    Reset,
    Acknowledged,
    DriverPresent,
    FeaturesNegotiated,
    QueueConfigured,
    DriverOk,
}

/// A VirtIO MMIO device driven through queue 0.
pub struct VirtioDevice<H: Hal> {
    regs: MmioRegisters,
    version: u32,
    device_id: u32,
    features: u64,
    queue: Mutex<SplitQueue<H>>,
}

impl<H: Hal> VirtioDevice<H> {
    /// Run the full initialization sequence on `regs`.
    ///
    /// On any failure after the reset the `FAILED` status bit is set and
    /// the error is returned; no partially initialized device escapes.
    pub fn new(regs: MmioRegisters) -> Result<Self, VirtioError> {
        let magic = regs.magic();
        if !regs.has_valid_magic() {
            return Err(VirtioError::BadSignature { found: magic });
        }
        let version = regs.version();
        if version != VERSION_LEGACY && version != VERSION_MODERN {
            return Err(VirtioError::UnsupportedVersion(version));
        }

        regs.reset();
        debug!("virtio@{:#x}: {:?}", regs.base(), LifecycleStage::Reset);

        Self::bring_up(regs, version).inspect_err(|err| {
            warn!("virtio@{:#x}: initialization failed: {}", regs.base(), err);
            regs.add_status(DeviceStatus::FAILED);
        })
    }

    fn bring_up(regs: MmioRegisters, version: u32) -> Result<Self, VirtioError> {
        let base = regs.base();
        let device_id = regs.device_id();

        regs.add_status(DeviceStatus::ACKNOWLEDGE);
        debug!("virtio@{:#x}: {:?}", base, LifecycleStage::Acknowledged);
        regs.add_status(DeviceStatus::DRIVER);
        debug!("virtio@{:#x}: {:?}", base, LifecycleStage::DriverPresent);

        let features = Self::negotiate(regs, version)?;
        debug!("virtio@{:#x}: {:?}", base, LifecycleStage::FeaturesNegotiated);

        let queue = Self::setup_queue(regs, version)?;
        debug!(
            "virtio@{:#x}: {:?} ({} entries)",
            base,
            LifecycleStage::QueueConfigured,
            queue.queue_len()
        );

        regs.add_status(DeviceStatus::DRIVER_OK);
        debug!("virtio@{:#x}: {:?}", base, LifecycleStage::DriverOk);

        Ok(Self {
            regs,
            version,
            device_id,
            features,
            queue: Mutex::new(queue),
        })
    }

    fn negotiate(regs: MmioRegisters, version: u32) -> Result<u64, VirtioError> {
        let mut offered = regs.device_features(0) as u64;
        let mut accepted = offered & ACCEPTED_FEATURES;
        regs.set_driver_features(0, accepted as u32);

        if version == VERSION_MODERN {
            let high = regs.device_features(1) as u64;
            offered |= high << 32;
            accepted |= (high << 32) & Features::VERSION_1.bits();
            regs.set_driver_features(1, (accepted >> 32) as u32);
        }
        trace!("virtio@{:#x}: read features: {}", regs.base(), Features::describe(offered));
        trace!(
            "virtio@{:#x}: negotiated features: {}",
            regs.base(),
            Features::describe(accepted)
        );

        regs.add_status(DeviceStatus::FEATURES_OK);
        if !regs.status().contains(DeviceStatus::FEATURES_OK) {
            return Err(VirtioError::FeaturesRejected { offered, accepted });
        }
        Ok(accepted)
    }

    fn setup_queue(regs: MmioRegisters, version: u32) -> Result<SplitQueue<H>, VirtioError> {
        regs.select_queue(0);
        if version == VERSION_MODERN && regs.queue_ready() {
            return Err(VirtioError::QueueInUse);
        }
        let max = regs.queue_num_max();
        if max == 0 {
            return Err(VirtioError::QueueUnavailable);
        }
        // Round down to a power of two.
        let queue_len = 1u32 << (31 - max.leading_zeros());

        let queue = SplitQueue::<H>::new(queue_len, version == VERSION_LEGACY)?;
        let addrs = queue.addresses();

        if version == VERSION_LEGACY {
            // QueuePFN is 32 bits wide: the rings must sit below 16 TiB.
            let pfn = u32::try_from(addrs.desc / PAGE_SIZE as u64)
                .map_err(|_| VirtioError::QueueAddressOutOfRange(addrs.desc))?;
            regs.set_queue_num(queue_len);
            regs.set_guest_page_size(PAGE_SIZE as u32);
            regs.set_queue_align(PAGE_SIZE as u32);
            regs.set_queue_pfn(pfn);
        } else {
            regs.set_queue_num(queue_len);
            regs.set_queue_desc(addrs.desc);
            regs.set_queue_driver(addrs.avail);
            regs.set_queue_device(addrs.used);
            regs.set_queue_ready(true);
        }
        Ok(queue)
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn registers(&self) -> &MmioRegisters {
        &self.regs
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_legacy(&self) -> bool {
        self.version == VERSION_LEGACY
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn device_type(&self) -> Option<DeviceType> {
        DeviceType::from_id(self.device_id)
    }

    /// Feature bits written back to the device.
    pub fn negotiated_features(&self) -> Features {
        Features::from_bits_retain(self.features)
    }

    pub fn queue_len(&self) -> u16 {
        self.queue.lock().queue_len()
    }

    pub fn free_descriptors(&self) -> usize {
        self.queue.lock().free_descriptors()
    }

    /// Run `f` with the queue locked, for inspection.
    pub fn with_queue<R>(&self, f: impl FnOnce(&SplitQueue<H>) -> R) -> R {
        f(&self.queue.lock())
    }

    /// Acknowledge whatever the device reports in `InterruptStatus`.
    pub fn ack_interrupt(&self) -> InterruptStatus {
        let status = self.regs.interrupt_status();
        if !status.is_empty() {
            self.regs.ack_interrupt(status);
        }
        status
    }

    // ── I/O ─────────────────────────────────────────────────────────

    /// Publish `requests` as one descriptor chain and notify the device.
    ///
    /// Returns the head descriptor index, `None` when `requests` is empty.
    pub fn submit(&self, requests: Vec<IoRequest>) -> Result<Option<u16>, VirtioError> {
        let head = self.queue.lock().submit(requests)?;
        if let Some(head) = head {
            // The device must see the new avail.idx before the doorbell.
            fence(Ordering::SeqCst);
            self.regs.notify(0);
            trace!("virtio@{:#x}: submitted chain {}", self.regs.base(), head);
        }
        Ok(head)
    }

    pub fn submit_one(&self, request: IoRequest) -> Result<Option<u16>, VirtioError> {
        self.submit(alloc::vec![request])
    }

    /// Take one completed chain, if the device has returned any.
    pub fn reap_one(&self) -> Option<alloc::boxed::Box<IoRequest>> {
        self.queue.lock().reap_one()
    }

    /// Spin until a completion arrives.
    pub fn wait_one(&self) -> alloc::boxed::Box<IoRequest> {
        loop {
            if let Some(req) = self.reap_one() {
                return req;
            }
            core::hint::spin_loop();
        }
    }

    /// Like [`wait_one`](Self::wait_one), but gives up after `max_polls`
    /// empty polls.
    pub fn poll_one(&self, max_polls: usize) -> Result<alloc::boxed::Box<IoRequest>, VirtioError> {
        for _ in 0..max_polls {
            if let Some(req) = self.reap_one() {
                return Ok(req);
            }
            core::hint::spin_loop();
        }
        Err(VirtioError::Timeout)
    }
}

impl<H: Hal> Drop for VirtioDevice<H> {
    fn drop(&mut self) {
        // Stop the device before its queue memory goes away.
        self.regs.reset();
        debug!("virtio@{:#x}: reset on drop", self.regs.base());
    }
}

impl<H: Hal> fmt::Debug for VirtioDevice<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtioDevice")
            .field("regs", &self.regs)
            .field("version", &self.version)
            .field("device_id", &self.device_id)
            .field("features", &format_args!("{:#x}", self.features))
            .finish()
    }
}
