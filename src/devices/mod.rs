//! Device discovery and drivers
//!
//! Candidate VirtIO MMIO windows are collected in a [`registry::DeviceRegistry`]
//! (usually from the device tree) and turned into drivers on demand.

pub mod registry;
pub mod virtio;

/// VirtIO device ids as reported in the `DeviceID` register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceType {
    Network = 1,
    Block = 2,
    Console = 3,
    Entropy = 4,
    LegacyBalloon = 5,
    IoMemory = 6,
    Rpmsg = 7,
    ScsiHost = 8,
    Transport9P = 9,
    Mac80211Wlan = 10,
    RprocSerial = 11,
    Caif = 12,
    Balloon = 13,
    Gpu = 16,
    Timer = 17,
    Input = 18,
    Socket = 19,
    Crypto = 20,
    SignalDistribution = 21,
    Pstore = 22,
    Iommu = 23,
    Memory = 24,
}

impl DeviceType {
    pub fn from_id(id: u32) -> Option<Self> {
        use DeviceType as D;

        Some(match id {
            1 => D::Network,
            2 => D::Block,
            3 => D::Console,
            4 => D::Entropy,
            5 => D::LegacyBalloon,
            6 => D::IoMemory,
            7 => D::Rpmsg,
            8 => D::ScsiHost,
            9 => D::Transport9P,
            10 => D::Mac80211Wlan,
            11 => D::RprocSerial,
            12 => D::Caif,
            13 => D::Balloon,
            16 => D::Gpu,
            17 => D::Timer,
            18 => D::Input,
            19 => D::Socket,
            20 => D::Crypto,
            21 => D::SignalDistribution,
            22 => D::Pstore,
            23 => D::Iommu,
            24 => D::Memory,
            _ => return None,
        })
    }

    pub fn id(self) -> u32 {
        self as u32
    }
}
