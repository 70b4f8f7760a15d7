//! Per-connection byte buffers: the bounded contiguous receive buffer and the
//! ordered outbound send queue.

use std::collections::VecDeque;
use std::io::{self, IoSlice};

use crate::socket::TcpSocket;

/// Contiguous receive buffer with a bounded capacity.
///
/// Data is appended at the tail and consumed from the front. Storage grows
/// geometrically up to the cap and is compacted when consumed bytes block the
/// tail. Invariant: `read ≤ write ≤ storage ≤ cap`.
pub struct RecvBuffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    cap: usize,
}

const INITIAL_CHUNK: usize = 4096;

impl RecvBuffer {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);
        RecvBuffer {
            buf: vec![0u8; cap.min(INITIAL_CHUNK)],
            start: 0,
            end: 0,
            cap,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The buffer holds `cap` unconsumed bytes; reads must pause until the
    /// data callback consumes.
    pub fn is_full(&self) -> bool {
        self.len() >= self.cap
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// The unconsumed bytes, front to back.
    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Drop `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        self.start += n.min(self.len());
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Writable tail space, compacting and growing (up to the cap) as needed.
    /// Empty when the buffer is full.
    pub fn spare(&mut self) -> &mut [u8] {
        if self.is_full() {
            return &mut [];
        }
        if self.end == self.buf.len() && self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if self.end == self.buf.len() && self.buf.len() < self.cap {
            let grown = (self.buf.len() * 2).max(INITIAL_CHUNK).min(self.cap);
            self.buf.resize(grown, 0);
        }
        &mut self.buf[self.end..]
    }

    /// Mark `n` bytes of the spare region as filled.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.buf.len());
        self.end += n;
    }

    /// Append bytes, growing past the cap if necessary. Used where the
    /// producer cannot be throttled mid-record (decrypted TLS plaintext).
    pub fn append(&mut self, data: &[u8]) {
        let needed = self.len() + data.len();
        if needed > self.buf.len() - self.start {
            if self.start > 0 {
                self.buf.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
            }
            if needed > self.buf.len() {
                self.buf.resize(needed.next_power_of_two(), 0);
            }
        }
        self.buf[self.end..self.end + data.len()].copy_from_slice(data);
        self.end += data.len();
    }
}

impl Default for RecvBuffer {
    fn default() -> Self {
        RecvBuffer {
            buf: Vec::new(),
            start: 0,
            end: 0,
            cap: 0,
        }
    }
}

struct SendBlock {
    data: Vec<u8>,
    written: usize,
}

/// Ordered queue of pending outbound blocks.
///
/// At most the head block is partially written; every other block has zero
/// bytes written. The total pending size is observable for high-water
/// accounting.
#[derive(Default)]
pub struct SendQueue {
    blocks: VecDeque<SendBlock>,
    pending: usize,
}

/// Cap on iovecs per scatter write.
const MAX_IOVECS: usize = 16;

impl SendQueue {
    pub fn new() -> Self {
        SendQueue::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.push_owned(data.to_vec());
    }

    pub fn push_owned(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.pending += data.len();
        self.blocks.push_back(SendBlock { data, written: 0 });
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total unsent bytes across all blocks.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// One scatter write of up to [`MAX_IOVECS`] blocks. Returns the bytes
    /// accepted by the kernel; would-block propagates as an error.
    pub fn write_to(&mut self, sock: &TcpSocket) -> io::Result<usize> {
        if self.blocks.is_empty() {
            return Ok(0);
        }
        let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(self.blocks.len().min(MAX_IOVECS));
        for block in self.blocks.iter().take(MAX_IOVECS) {
            slices.push(IoSlice::new(&block.data[block.written..]));
        }
        let n = sock.send_vectored(&slices)?;
        self.advance(n);
        Ok(n)
    }

    /// Account for `n` bytes written, releasing fully-sent head blocks.
    pub fn advance(&mut self, mut n: usize) {
        self.pending -= n.min(self.pending);
        while n > 0 {
            let head = match self.blocks.front_mut() {
                Some(h) => h,
                None => return,
            };
            let left = head.data.len() - head.written;
            if n >= left {
                n -= left;
                self.blocks.pop_front();
            } else {
                head.written += n;
                return;
            }
        }
    }
}
