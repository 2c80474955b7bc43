//! Split virtqueue memory layout.
//!
//! One page-aligned block holds the three areas in fixed order: descriptor
//! table, available ring, used ring. Modern devices receive one address per
//! area, so each area is page-rounded on its own. Legacy devices only receive
//! the page frame of the descriptor table and derive the rest themselves:
//! the available ring directly follows the table and the used ring starts at
//! the next `queue_align` boundary.

use core::mem::size_of;

use super::desc::Descriptor;
use crate::error::VirtioError;
use crate::platform::PAGE_SIZE;

/// Largest queue a split virtqueue can address (15-bit descriptor index).
pub const MAX_QUEUE_LEN: u32 = 32768;

/// `flags` + `idx` header shared by both rings.
const RING_HEADER: usize = 4;
/// Trailing `used_event` / `avail_event` word.
const RING_EVENT: usize = 2;
/// `{ id: u32, len: u32 }`
const USED_ELEM: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    queue_len: u16,
    avail_offset: usize,
    used_offset: usize,
    total_size: usize,
}

impl QueueLayout {
    /// Compute the layout for `queue_len` entries.
    pub fn new(queue_len: u32, legacy: bool) -> Result<Self, VirtioError> {
        if queue_len == 0 {
            return Err(VirtioError::QueueUnavailable);
        }
        if queue_len > MAX_QUEUE_LEN || !queue_len.is_power_of_two() {
            return Err(VirtioError::BadQueueSize(queue_len));
        }
        let n = queue_len as usize;

        let desc_bytes = n * size_of::<Descriptor>();
        let avail_bytes = RING_HEADER + n * size_of::<u16>() + RING_EVENT;
        let used_bytes = RING_HEADER + n * USED_ELEM + RING_EVENT;

        let (avail_offset, used_offset, total_size) = if legacy {
            let used_offset = align_up(desc_bytes + avail_bytes, PAGE_SIZE);
            (desc_bytes, used_offset, used_offset + align_up(used_bytes, PAGE_SIZE))
        } else {
            let avail_offset = align_up(desc_bytes, PAGE_SIZE);
            let used_offset = avail_offset + align_up(avail_bytes, PAGE_SIZE);
            (avail_offset, used_offset, used_offset + align_up(used_bytes, PAGE_SIZE))
        };

        Ok(Self {
            queue_len: queue_len as u16,
            avail_offset,
            used_offset,
            total_size,
        })
    }

    /// Number of ring entries.
    pub fn queue_len(&self) -> u16 {
        self.queue_len
    }

    pub fn desc_offset(&self) -> usize {
        0
    }

    pub fn avail_offset(&self) -> usize {
        self.avail_offset
    }

    pub fn used_offset(&self) -> usize {
        self.used_offset
    }

    /// Total bytes of the block (always a whole number of pages).
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn pages(&self) -> usize {
        self.total_size / PAGE_SIZE
    }
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
