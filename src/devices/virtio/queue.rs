//! Split virtqueue, driver side.
//!
//! The driver owns the descriptor table and the available ring and only
//! reads the used ring. The device is free to start processing as soon as it
//! observes a new `avail.idx`, so everything a chain consists of is written
//! before that index is published, and the index before the doorbell.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, Ordering};

use super::desc::{DescFlags, Descriptor, DescriptorAllocator};
use super::layout::QueueLayout;
use super::request::{IoOp, IoRequest};
use crate::error::VirtioError;
use crate::mm::{Hal, PhysAddr};

/// Offset of `idx` inside both ring headers (after `flags`).
const RING_IDX: usize = 2;
/// Offset of the first ring entry (after `flags` and `idx`).
const RING_ENTRIES: usize = 4;

/// A single used ring element.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsedElem {
    /// Head descriptor index of the completed chain
    pub id: u32,
    /// Bytes written by the device into the chain
    pub len: u32,
}

/// Device-visible addresses of the three queue areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAddresses {
    pub desc: PhysAddr,
    pub avail: PhysAddr,
    pub used: PhysAddr,
}

/// A published chain waiting for the device.
struct Pending {
    head: u16,
    request: Box<IoRequest>,
}

/// Split virtqueue state: queue memory, free descriptors, in-flight chains.
pub struct SplitQueue<H: Hal> {
    layout: QueueLayout,
    paddr: PhysAddr,
    vaddr: NonNull<u8>,
    descs: DescriptorAllocator,
    /// In-flight chains, indexed by head descriptor
    pending: Vec<Option<Pending>>,
    /// Shadow of `avail.idx`; only the driver writes it
    avail_idx: u16,
    /// Number of used entries consumed so far
    last_used: u16,
    _hal: PhantomData<fn() -> H>,
}

// Safety: the queue memory is exclusively owned by this value; the device
// side only touches it through DMA.
unsafe impl<H: Hal> Send for SplitQueue<H> {}

impl<H: Hal> SplitQueue<H> {
    /// Allocate and zero queue memory for `queue_len` entries.
    pub fn new(queue_len: u32, legacy: bool) -> Result<Self, VirtioError> {
        let layout = QueueLayout::new(queue_len, legacy)?;
        let pages = layout.pages();
        let (paddr, vaddr) = H::dma_alloc(pages).ok_or(VirtioError::OutOfMemory { pages })?;
        unsafe { ptr::write_bytes(vaddr.as_ptr(), 0, layout.total_size()) };

        let len = layout.queue_len();
        let mut pending = Vec::with_capacity(len as usize);
        pending.resize_with(len as usize, || None);

        Ok(Self {
            layout,
            paddr,
            vaddr,
            descs: DescriptorAllocator::new(len),
            pending,
            avail_idx: 0,
            last_used: 0,
            _hal: PhantomData,
        })
    }

    pub fn queue_len(&self) -> u16 {
        self.layout.queue_len()
    }

    pub fn layout(&self) -> &QueueLayout {
        &self.layout
    }

    pub fn addresses(&self) -> QueueAddresses {
        QueueAddresses {
            desc: self.paddr + self.layout.desc_offset() as u64,
            avail: self.paddr + self.layout.avail_offset() as u64,
            used: self.paddr + self.layout.used_offset() as u64,
        }
    }

    /// Published `avail.idx` (total chains ever submitted, wrapping).
    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    /// Total completions consumed (wrapping).
    pub fn last_used_idx(&self) -> u16 {
        self.last_used
    }

    pub fn free_descriptors(&self) -> usize {
        self.descs.free_count()
    }

    pub fn is_descriptor_free(&self, index: u16) -> bool {
        self.descs.is_free(index)
    }

    /// Chains published but not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.avail_idx.wrapping_sub(self.last_used) as usize
    }

    // ── Raw queue memory ────────────────────────────────────────────

    fn area(&self, offset: usize) -> *mut u8 {
        unsafe { self.vaddr.as_ptr().add(offset) }
    }

    fn desc_ptr(&self, index: u16) -> *mut Descriptor {
        assert!(index < self.queue_len(), "descriptor {} out of range", index);
        unsafe { (self.area(self.layout.desc_offset()) as *mut Descriptor).add(index as usize) }
    }

    /// Read back descriptor `index` from the table.
    pub fn descriptor(&self, index: u16) -> Descriptor {
        let raw = unsafe { ptr::read_volatile(self.desc_ptr(index)) };
        Descriptor {
            addr: u64::from_le(raw.addr),
            len: u32::from_le(raw.len),
            flags: u16::from_le(raw.flags),
            next: u16::from_le(raw.next),
        }
    }

    fn write_descriptor(&mut self, index: u16, desc: Descriptor) {
        let raw = Descriptor {
            addr: desc.addr.to_le(),
            len: desc.len.to_le(),
            flags: desc.flags.to_le(),
            next: desc.next.to_le(),
        };
        unsafe { ptr::write_volatile(self.desc_ptr(index), raw) };
    }

    fn slot(&self, idx: u16) -> usize {
        (idx % self.queue_len()) as usize
    }

    fn used_idx(&self) -> u16 {
        let ptr = self.area(self.layout.used_offset() + RING_IDX) as *const u16;
        u16::from_le(unsafe { ptr::read_volatile(ptr) })
    }

    fn used_elem(&self, slot: usize) -> UsedElem {
        let base = self.area(self.layout.used_offset() + RING_ENTRIES) as *const UsedElem;
        let raw = unsafe { ptr::read_volatile(base.add(slot)) };
        UsedElem {
            id: u32::from_le(raw.id),
            len: u32::from_le(raw.len),
        }
    }

    fn publish(&mut self, head: u16) {
        let slot = self.slot(self.avail_idx);
        let ring = self.area(self.layout.avail_offset() + RING_ENTRIES) as *mut u16;
        unsafe { ptr::write_volatile(ring.add(slot), head.to_le()) };

        // Descriptors and the ring entry must be visible before the index.
        fence(Ordering::Release);

        self.avail_idx = self.avail_idx.wrapping_add(1);
        let idx = self.area(self.layout.avail_offset() + RING_IDX) as *mut u16;
        unsafe { ptr::write_volatile(idx, self.avail_idx.to_le()) };
    }

    // ── Submission / completion ─────────────────────────────────────

    /// Build a descriptor chain from `requests` (in order) and publish it.
    ///
    /// Returns the head descriptor index, or `None` for an empty list. The
    /// caller still has to notify the device. Nothing is allocated or
    /// published when an error is returned.
    pub fn submit(&mut self, requests: Vec<IoRequest>) -> Result<Option<u16>, VirtioError> {
        if requests.is_empty() {
            return Ok(None);
        }
        let queue_len = self.queue_len();
        if requests.len() > queue_len as usize {
            return Err(VirtioError::ChainTooLong {
                requested: requests.len(),
                queue_len,
            });
        }
        let chain = self
            .descs
            .allocate_chain(requests.len())
            .ok_or(VirtioError::QueueFull {
                requested: requests.len(),
                free: self.descs.free_count(),
            })?;

        for (pos, (req, &index)) in requests.iter().zip(chain.iter()).enumerate() {
            let mut flags = DescFlags::empty();
            if req.op() == IoOp::Write {
                flags |= DescFlags::WRITE;
            }
            let next = match chain.get(pos + 1) {
                Some(&next) => {
                    flags |= DescFlags::NEXT;
                    next
                }
                None => 0,
            };
            let addr = NonNull::new(req.buffer_ptr() as *mut u8)
                .map(H::virt_to_phys)
                .unwrap_or(0);
            self.write_descriptor(
                index,
                Descriptor {
                    addr,
                    len: req.len() as u32,
                    flags: flags.bits(),
                    next,
                },
            );
        }

        // Link the requests the same way the descriptors are linked.
        let mut head_request: Option<Box<IoRequest>> = None;
        for mut req in requests.into_iter().rev() {
            req.mark_pending();
            req.set_next(head_request.take());
            head_request = Some(Box::new(req));
        }
        let Some(request) = head_request else {
            return Ok(None);
        };

        let head = chain[0];
        let entry = &mut self.pending[head as usize];
        assert!(
            entry.is_none(),
            "descriptor {} handed out while its chain is still in flight",
            head
        );
        *entry = Some(Pending { head, request });
        self.publish(head);

        Ok(Some(head))
    }

    /// Whether the device has returned a chain that has not been reaped.
    pub fn has_completion(&self) -> bool {
        self.used_idx() != self.last_used
    }

    /// Take one completed chain off the used ring, if any.
    ///
    /// The device may complete chains in any order; the used entry's id
    /// names the head it finished. An id with no chain in flight means the
    /// ring is corrupted and panics.
    pub fn reap_one(&mut self) -> Option<Box<IoRequest>> {
        if !self.has_completion() {
            return None;
        }
        // Read the used element only after observing the index.
        fence(Ordering::Acquire);

        let slot = self.slot(self.last_used);
        let elem = self.used_elem(slot);
        let taken = usize::try_from(elem.id)
            .ok()
            .and_then(|id| self.pending.get_mut(id))
            .and_then(Option::take);
        let Some(Pending { head, mut request }) = taken else {
            panic!("used ring entry {} has no pending request (id {})", slot, elem.id);
        };

        self.free_chain(head);
        request.complete(elem.len);
        self.last_used = self.last_used.wrapping_add(1);
        Some(request)
    }

    fn free_chain(&mut self, head: u16) {
        let mut index = head;
        for _ in 0..self.queue_len() {
            let desc = self.descriptor(index);
            self.descs.free(index);
            if !desc.has_next() {
                return;
            }
            index = desc.next;
        }
        panic!("descriptor chain starting at {} does not terminate", head);
    }
}

impl<H: Hal> Drop for SplitQueue<H> {
    fn drop(&mut self) {
        unsafe { H::dma_dealloc(self.paddr, self.vaddr, self.layout.pages()) };
    }
}
