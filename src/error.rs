//! Error type shared by the transport, queue and registry.

use thiserror::Error;

/// Everything that can go wrong while bringing up or driving a VirtIO device.
///
/// Setup errors (`BadSignature` .. `OutOfMemory`) are fatal for the device
/// being constructed. `QueueFull` is backpressure and can be retried once
/// completions have been reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VirtioError {
    #[error("not a virtio-mmio device (magic {found:#010x})")]
    BadSignature { found: u32 },

    #[error("unsupported virtio-mmio version {0}")]
    UnsupportedVersion(u32),

    #[error("device rejected features {accepted:#x} (offered {offered:#x})")]
    FeaturesRejected { offered: u64, accepted: u64 },

    #[error("queue 0 is not available on this device")]
    QueueUnavailable,

    #[error("queue 0 is already marked ready")]
    QueueInUse,

    #[error("queue size {0} is not a power of two up to 32768")]
    BadQueueSize(u32),

    #[error("queue memory at {0:#x} is beyond what a legacy page frame number can address")]
    QueueAddressOutOfRange(u64),

    #[error("out of DMA memory ({pages} pages requested)")]
    OutOfMemory { pages: usize },

    #[error("device registry is full")]
    RegistryFull,

    #[error("chain of {requested} descriptors does not fit a queue of {queue_len}")]
    ChainTooLong { requested: usize, queue_len: u16 },

    #[error("{requested} descriptors requested, {free} free")]
    QueueFull { requested: usize, free: usize },

    #[error("no completion arrived in time")]
    Timeout,

    #[error("invalid flattened device tree")]
    InvalidDeviceTree,
}
