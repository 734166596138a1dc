//! Power-of-two ring buffer for client I/O.
//!
//! Used for both the read and write side of every client:
//! - Scale-to-zero: no allocation until first write, released when drained
//! - Lock-free pooling: buffers are reused across clients via crossbeam-queue
//! - Length derived from head/tail, so it cannot become inconsistent
//! - Power-of-two sizing enables bitmask indexing (`& (cap-1)` vs `% cap`)
//! - Soft watermark reports backpressure (`WouldBlock`); the hard cap
//!   reports overflow (`OutOfMemory`) and the owner disconnects the client

use std::io::{self, IoSlice};
use std::sync::LazyLock;

use crossbeam_queue::ArrayQueue;

/// Minimum buffer size (4KB) - smallest pooled size.
const MIN_SIZE: usize = 4096;

const POOL_CAPACITY_4K: usize = 256;
const POOL_CAPACITY_16K: usize = 64;
const POOL_CAPACITY_64K: usize = 32;

// Global lock-free buffer pools by size class.
static POOL_4K: LazyLock<ArrayQueue<Box<[u8]>>> =
    LazyLock::new(|| ArrayQueue::new(POOL_CAPACITY_4K));
static POOL_16K: LazyLock<ArrayQueue<Box<[u8]>>> =
    LazyLock::new(|| ArrayQueue::new(POOL_CAPACITY_16K));
static POOL_64K: LazyLock<ArrayQueue<Box<[u8]>>> =
    LazyLock::new(|| ArrayQueue::new(POOL_CAPACITY_64K));

/// Acquire a buffer from the pool, or allocate a new one.
/// Size is rounded up to the nearest power of two (minimum MIN_SIZE).
#[inline]
fn pool_acquire(size: usize) -> Box<[u8]> {
    let size = size.next_power_of_two().max(MIN_SIZE);

    let maybe_buf = match size {
        4096 => POOL_4K.pop(),
        16384 => POOL_16K.pop(),
        65536 => POOL_64K.pop(),
        _ => None, // Other sizes not pooled
    };

    maybe_buf.unwrap_or_else(|| vec![0u8; size].into_boxed_slice())
}

/// Release a buffer back to the pool (drops if pool full or size unpooled).
#[inline]
fn pool_release(buf: Box<[u8]>) {
    match buf.len() {
        4096 => {
            let _ = POOL_4K.push(buf);
        }
        16384 => {
            let _ = POOL_16K.push(buf);
        }
        65536 => {
            let _ = POOL_64K.push(buf);
        }
        _ => {}
    }
}

/// A circular buffer with power-of-two sizing and watermark accounting.
///
/// Head and tail are unbounded and wrap naturally via `wrapping_sub`;
/// positions are derived with a bitmask.
pub struct RingBuffer {
    /// Buffer storage, None when empty (scale-to-zero).
    buf: Option<Box<[u8]>>,
    /// Write position (unbounded).
    head: usize,
    /// Read position (unbounded).
    tail: usize,
    /// Queueing beyond this length reports `WouldBlock`.
    soft_limit: usize,
    /// Queueing beyond this length reports `OutOfMemory`.
    hard_limit: usize,
    /// Requires two consecutive eligible states before releasing the
    /// allocation, preventing shrink/grow cycles during bursty traffic.
    shrink_primed: bool,
}

impl RingBuffer {
    /// Create a buffer with the given watermarks. Pass `soft == hard` to
    /// disable the backpressure watermark (read-side buffers do this).
    pub fn new(soft_limit: usize, hard_limit: usize) -> Self {
        debug_assert!(soft_limit <= hard_limit);
        Self {
            buf: None,
            head: 0,
            tail: 0,
            soft_limit,
            hard_limit,
            shrink_primed: false,
        }
    }

    /// Number of bytes available for reading.
    #[inline]
    pub fn len(&self) -> usize {
        self.head.wrapping_sub(self.tail)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Capacity of the current allocation (0 when scale-to-zero).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    /// True when the buffered length has crossed the soft watermark.
    #[inline]
    pub fn above_soft_limit(&self) -> bool {
        self.len() > self.soft_limit
    }

    /// Append bytes, growing (from the pool) as needed.
    ///
    /// Errors: `WouldBlock` once the soft watermark is exceeded,
    /// `OutOfMemory` when the write would cross the hard cap.
    pub fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let len = self.len();
        if len + data.len() > self.hard_limit {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "buffer hard limit exceeded",
            ));
        }
        if len > self.soft_limit {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "buffer soft limit exceeded",
            ));
        }

        self.ensure_capacity(len + data.len());
        let buf = match self.buf.as_mut() {
            Some(buf) => buf,
            None => unreachable!("ensure_capacity always allocates"),
        };

        let cap = buf.len();
        let head_pos = self.head & (cap - 1);
        let first = data.len().min(cap - head_pos);
        buf[head_pos..head_pos + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            let second = data.len() - first;
            buf[..second].copy_from_slice(&data[first..]);
        }
        self.head = self.head.wrapping_add(data.len());
        self.shrink_primed = false;
        Ok(())
    }

    /// Grow to at least `needed`, preserving content in read order.
    fn ensure_capacity(&mut self, needed: usize) {
        let cap = self.capacity();
        if cap >= needed {
            return;
        }

        let mut new_buf = pool_acquire(needed);
        let len = self.len();
        if let Some(old) = self.buf.take() {
            let old_cap = old.len();
            let tail_pos = self.tail & (old_cap - 1);
            let first = len.min(old_cap - tail_pos);
            new_buf[..first].copy_from_slice(&old[tail_pos..tail_pos + first]);
            if first < len {
                new_buf[first..len].copy_from_slice(&old[..len - first]);
            }
            pool_release(old);
        }
        self.buf = Some(new_buf);
        self.tail = 0;
        self.head = len;
    }

    /// Contiguous readable bytes (up to the wrap point).
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        match &self.buf {
            None => &[],
            Some(buf) => {
                let len = self.len();
                if len == 0 {
                    return &[];
                }
                let cap = buf.len();
                let tail_pos = self.tail & (cap - 1);
                let contiguous = (cap - tail_pos).min(len);
                &buf[tail_pos..tail_pos + contiguous]
            }
        }
    }

    /// Two slices for vectored socket writes (handles wraparound in one syscall).
    #[inline]
    pub fn as_io_slices(&self) -> [IoSlice<'_>; 2] {
        let buf = match &self.buf {
            None => return [IoSlice::new(&[]), IoSlice::new(&[])],
            Some(buf) => buf,
        };

        let len = self.len();
        if len == 0 {
            return [IoSlice::new(&[]), IoSlice::new(&[])];
        }

        let cap = buf.len();
        let tail_pos = self.tail & (cap - 1);
        let to_end = cap - tail_pos;

        if len <= to_end {
            [
                IoSlice::new(&buf[tail_pos..tail_pos + len]),
                IoSlice::new(&[]),
            ]
        } else {
            [
                IoSlice::new(&buf[tail_pos..]),
                IoSlice::new(&buf[..len - to_end]),
            ]
        }
    }

    /// Mark `n` bytes as read.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.tail = self.tail.wrapping_add(n);
        if self.is_empty() {
            // Reset to offset zero so the next write is contiguous.
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Move all buffered bytes into `out`, emptying the buffer.
    pub fn drain_into(&mut self, out: &mut Vec<u8>) {
        while !self.is_empty() {
            let taken = {
                let slice = self.read_slice();
                out.extend_from_slice(slice);
                slice.len()
            };
            self.consume(taken);
        }
    }

    /// Release the allocation back to the pool if the buffer has been
    /// empty for two consecutive calls.
    pub fn maybe_shrink(&mut self) {
        if !self.is_empty() {
            self.shrink_primed = false;
            return;
        }
        if self.shrink_primed {
            if let Some(buf) = self.buf.take() {
                pool_release(buf);
            }
            self.head = 0;
            self.tail = 0;
            self.shrink_primed = false;
        } else if self.buf.is_some() {
            self.shrink_primed = true;
        }
    }
}
