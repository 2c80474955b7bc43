//! I/O requests handed to a virtqueue.

use alloc::boxed::Box;
use alloc::vec::Vec;

/// Which side of the transfer the device is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    /// Device reads the buffer (driver → device).
    Read,
    /// Device writes the buffer (device → driver); the descriptor is marked
    /// `WRITE`.
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    /// Not yet submitted.
    Idle,
    /// Published to the device, waiting for completion.
    Pending,
    /// Returned by the device through the used ring.
    Done,
}

/// One buffer of a descriptor chain.
///
/// Requests submitted together are linked through `next`, so the head
/// returned on completion owns the whole chain.
#[derive(Debug)]
pub struct IoRequest {
    buffer: Vec<u8>,
    op: IoOp,
    state: IoState,
    used_len: u32,
    next: Option<Box<IoRequest>>,
}

impl IoRequest {
    pub fn new(op: IoOp, buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            op,
            state: IoState::Idle,
            used_len: 0,
            next: None,
        }
    }

    /// A zeroed, device-writable buffer of `len` bytes.
    pub fn device_writable(len: usize) -> Self {
        Self::new(IoOp::Write, alloc::vec![0; len])
    }

    pub fn op(&self) -> IoOp {
        self.op
    }

    pub fn state(&self) -> IoState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Bytes the device reported as written; only meaningful on the chain
    /// head once `Done`.
    pub fn used_len(&self) -> u32 {
        self.used_len
    }

    pub fn next(&self) -> Option<&IoRequest> {
        self.next.as_deref()
    }

    pub fn take_next(&mut self) -> Option<Box<IoRequest>> {
        self.next.take()
    }

    /// Number of requests in the chain starting here.
    pub fn chain_len(&self) -> usize {
        let mut len = 1;
        let mut cur = self.next();
        while let Some(req) = cur {
            len += 1;
            cur = req.next();
        }
        len
    }

    /// Put a completed request back into its initial state for re-use.
    pub fn recycle(&mut self) {
        self.state = IoState::Idle;
        self.used_len = 0;
    }

    pub(crate) fn mark_pending(&mut self) {
        self.state = IoState::Pending;
    }

    pub(crate) fn set_next(&mut self, next: Option<Box<IoRequest>>) {
        self.next = next;
    }

    /// Mark the whole chain done; `used_len` goes to the head only.
    pub(crate) fn complete(&mut self, used_len: u32) {
        self.used_len = used_len;
        let mut cur = Some(self);
        while let Some(req) = cur {
            req.state = IoState::Done;
            cur = req.next.as_deref_mut();
        }
    }

    pub(crate) fn buffer_ptr(&self) -> *const u8 {
        self.buffer.as_ptr()
    }
}
