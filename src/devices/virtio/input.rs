//! VirtIO input (keyboard) front end.
//!
//! Keeps a few event buffers posted on the event queue and turns key-press
//! events into key codes.

use alloc::boxed::Box;
use alloc::string::String;

use log::{info, trace, warn};

use super::mmio::MmioRegisters;
use super::request::IoRequest;
use super::VirtioDevice;
use crate::devices::registry::DeviceRegistry;
use crate::devices::DeviceType;
use crate::error::VirtioError;
use crate::mm::Hal;
use crate::platform::INPUT_EVENT_BUFFERS;

/// Config space select value for the device name.
const CFG_ID_NAME: u8 = 0x01;
const CFG_SELECT: usize = 0;
const CFG_SUBSEL: usize = 1;
const CFG_SIZE: usize = 2;
const CFG_DATA: usize = 8;
const CFG_DATA_MAX: usize = 128;

pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;

/// Size of one event on the wire.
pub const EVENT_SIZE: usize = 8;

/// One `virtio_input_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub event_type: u16,
    pub code: u16,
    pub value: u32,
}

impl InputEvent {
    /// Decode a little-endian event; `None` if `bytes` is too short.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < EVENT_SIZE {
            return None;
        }
        Some(Self {
            event_type: u16::from_le_bytes([bytes[0], bytes[1]]),
            code: u16::from_le_bytes([bytes[2], bytes[3]]),
            value: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    /// Key code of a key press (value 1); releases and repeats yield `None`.
    pub fn key_press(&self) -> Option<u16> {
        (self.event_type == EV_KEY && self.value == 1).then_some(self.code)
    }
}

/// Read the device name out of config space.
pub fn read_name(regs: &MmioRegisters) -> String {
    regs.config_write8(CFG_SELECT, CFG_ID_NAME);
    regs.config_write8(CFG_SUBSEL, 0);
    let size = (regs.config_read8(CFG_SIZE) as usize).min(CFG_DATA_MAX);
    (0..size)
        .map(|i| regs.config_read8(CFG_DATA + i))
        .take_while(|&b| b != 0)
        .map(char::from)
        .collect()
}

/// The first VirtIO input device, with its event buffers posted.
pub struct InputDevice<H: Hal> {
    device: VirtioDevice<H>,
    name: String,
}

impl<H: Hal> InputDevice<H> {
    /// Log every input device in `registry` and bring up the first one.
    ///
    /// Returns `Ok(None)` when there is no input device at all.
    pub fn probe(registry: &DeviceRegistry) -> Result<Option<Self>, VirtioError> {
        let mut count = 0;
        while let Some(res) = registry.find(DeviceType::Input, count) {
            info!("virtio_input[{}]: {}", count, read_name(&res.registers()));
            count += 1;
        }
        trace!("virtio_input count: {}", count);

        let Some(res) = registry.find(DeviceType::Input, 0) else {
            return Ok(None);
        };
        let regs = res.registers();
        let device = VirtioDevice::<H>::new(regs)?;
        let name = read_name(&regs);

        let buffers = INPUT_EVENT_BUFFERS.min(device.queue_len() as usize);
        for _ in 0..buffers {
            device.submit_one(IoRequest::device_writable(EVENT_SIZE))?;
        }
        Ok(Some(Self { device, name }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &VirtioDevice<H> {
        &self.device
    }

    /// Consume one pending event, if any, and return its key code when it
    /// is a key press. The event buffer goes back to the device either way.
    pub fn get_key(&self) -> Option<u16> {
        let req = self.device.reap_one()?;
        let key = InputEvent::parse(req.buffer()).and_then(|ev| ev.key_press());
        self.repost(req);
        key
    }

    /// Spin until a key is pressed.
    pub fn wait_for_key(&self) -> u16 {
        loop {
            if let Some(key) = self.get_key() {
                return key;
            }
            core::hint::spin_loop();
        }
    }

    fn repost(&self, req: Box<IoRequest>) {
        let mut req = *req;
        req.recycle();
        req.buffer_mut().fill(0);
        if let Err(err) = self.device.submit_one(req) {
            warn!("virtio_input: failed to re-post event buffer: {}", err);
        }
    }
}
