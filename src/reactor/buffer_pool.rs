//! Per-reactor, size-bucketed free-list of reusable byte buffers.
//!
//! A pool keyed by power-of-two capacity bucket, with explicit reference
//! counting rather than a single-owner/RAII model: `allocate`/`recycle`
//! pairs let a buffer be retained by more than one owner (e.g. a TLS adapter
//! holding a buffer the socket layer also references briefly) before being
//! returned to the pool.

use std::collections::HashMap;

/// A pool-owned byte buffer with independent read/write cursors.
///
/// `0 <= read <= write <= capacity` always holds. Using a buffer after its
/// last `recycle()` is a logic error; debug builds catch it via
/// `debug_assert!` on `recycled`.
#[derive(Debug)]
pub struct PoolBuffer {
    data: Vec<u8>,
    read: usize,
    write: usize,
    bucket: usize,
    refs: usize,
    recycled: bool,
}

impl PoolBuffer {
    fn fresh(bucket: usize, capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            read: 0,
            write: 0,
            bucket,
            refs: 1,
            recycled: false,
        }
    }

    fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
        self.refs = 1;
        self.recycled = false;
    }

    /// Bytes available to read.
    pub fn remaining(&self) -> usize {
        debug_assert!(!self.recycled, "use of a recycled PoolBuffer");
        self.write - self.read
    }

    /// Bytes available to write before the buffer is full.
    pub fn remaining_mut(&self) -> usize {
        debug_assert!(!self.recycled, "use of a recycled PoolBuffer");
        self.data.len() - self.write
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The unread portion of the buffer.
    pub fn as_read_slice(&self) -> &[u8] {
        debug_assert!(!self.recycled, "use of a recycled PoolBuffer");
        &self.data[self.read..self.write]
    }

    /// The unwritten tail of the buffer, for callers (e.g. a socket read
    /// syscall) that fill it directly.
    pub fn as_write_slice_mut(&mut self) -> &mut [u8] {
        debug_assert!(!self.recycled, "use of a recycled PoolBuffer");
        &mut self.data[self.write..]
    }

    pub fn mark_read(&mut self, n: usize) {
        debug_assert!(!self.recycled, "use of a recycled PoolBuffer");
        self.read = self.write.min(self.read + n);
    }

    pub fn mark_written(&mut self, n: usize) {
        debug_assert!(!self.recycled, "use of a recycled PoolBuffer");
        self.write = self.data.len().min(self.write + n);
    }

    /// Appends `bytes`, growing via the owning pool's bucket scheme is not
    /// possible here (no back-reference to the pool) — callers needing
    /// growth should `BufferPool::allocate` a larger buffer and copy, which
    /// is what the TCP write-merge path and the TLS overflow path both do.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        debug_assert!(!self.recycled, "use of a recycled PoolBuffer");
        debug_assert!(self.remaining_mut() >= bytes.len());
        let start = self.write;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.mark_written(bytes.len());
    }

    /// Slides the unread bytes to the front, reclaiming leading space. Used
    /// by the TLS adapter's `BUFFER_UNDERFLOW` handling and by chunked
    /// parsing across fragmented reads.
    pub fn compact(&mut self) {
        debug_assert!(!self.recycled, "use of a recycled PoolBuffer");
        if self.read == 0 {
            return;
        }
        self.data.copy_within(self.read..self.write, 0);
        self.write -= self.read;
        self.read = 0;
    }

    fn retain(&mut self) {
        self.refs += 1;
    }
}

/// Size-bucketed free-list. `allocate` rounds up to the next power-of-two
/// bucket; `recycle` returns a zero-refcount buffer to its bucket, subject to
/// an optional cap on total retained bytes.
#[derive(Debug)]
pub struct BufferPool {
    buckets: HashMap<usize, Vec<PoolBuffer>>,
    cap_bytes: Option<usize>,
    retained_bytes: usize,
}

impl BufferPool {
    pub fn new(cap_bytes: Option<usize>) -> Self {
        Self {
            buckets: HashMap::new(),
            cap_bytes,
            retained_bytes: 0,
        }
    }

    fn bucket_capacity(min_size: usize) -> usize {
        min_size.max(1).next_power_of_two()
    }

    /// Returns a buffer whose capacity is at least `min_size`, with
    /// `refs == 1`.
    pub fn allocate(&mut self, min_size: usize) -> PoolBuffer {
        let capacity = Self::bucket_capacity(min_size);
        if let Some(list) = self.buckets.get_mut(&capacity) {
            if let Some(mut buf) = list.pop() {
                self.retained_bytes = self.retained_bytes.saturating_sub(buf.capacity());
                buf.reset();
                return buf;
            }
        }
        PoolBuffer::fresh(capacity, capacity)
    }

    /// Grows `buf` in place to at least `min_size` by swapping in a larger
    /// pool buffer and copying unread bytes over; used by the TLS adapter's
    /// `BUFFER_OVERFLOW` handling.
    pub fn grow(&mut self, buf: &mut PoolBuffer, min_size: usize) {
        if buf.capacity() >= min_size {
            return;
        }
        let new_cap = Self::bucket_capacity(min_size.max(buf.capacity() * 2));
        let mut bigger = self.allocate(new_cap);
        bigger.extend_from_slice(buf.as_read_slice());
        let old = std::mem::replace(buf, bigger);
        self.recycle(old);
    }

    /// Bumps the refcount so more than one owner can hold the same buffer
    /// before each calls `recycle`.
    pub fn share(&self, buf: &mut PoolBuffer) {
        let _ = self;
        buf.retain();
    }

    /// Decrements `refs`; once it reaches zero the buffer returns to its
    /// bucket (unless the pool is already at its retained-byte cap, in which
    /// case it is simply dropped).
    pub fn recycle(&mut self, mut buf: PoolBuffer) {
        debug_assert!(buf.refs > 0, "recycle called more times than allocate");
        buf.refs -= 1;
        if buf.refs > 0 {
            return;
        }
        buf.recycled = true;
        if let Some(cap) = self.cap_bytes {
            if self.retained_bytes + buf.capacity() > cap {
                return;
            }
        }
        self.retained_bytes += buf.capacity();
        self.buckets.entry(buf.capacity()).or_default().push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_rounds_up_to_power_of_two() {
        let mut pool = BufferPool::new(None);
        let buf = pool.allocate(100);
        assert_eq!(buf.capacity(), 128);
    }

    #[test]
    fn recycle_then_allocate_reuses_storage() {
        let mut pool = BufferPool::new(None);
        let buf = pool.allocate(64);
        pool.recycle(buf);
        let buf2 = pool.allocate(64);
        assert_eq!(buf2.capacity(), 64);
        assert_eq!(pool.retained_bytes, 0);
    }

    #[test]
    fn shared_buffer_returns_to_pool_only_after_all_recycles() {
        let mut pool = BufferPool::new(None);
        let mut buf = pool.allocate(64);
        pool.share(&mut buf);
        pool.recycle(buf);
        assert_eq!(pool.buckets.get(&64).map(Vec::len).unwrap_or(0), 0);
    }

    #[test]
    fn pool_cap_drops_excess_recycled_bytes() {
        let mut pool = BufferPool::new(Some(32));
        let buf = pool.allocate(64);
        pool.recycle(buf);
        assert_eq!(pool.retained_bytes, 0);
        assert!(pool.buckets.get(&64).map(Vec::is_empty).unwrap_or(true));
    }

    #[test]
    fn compact_slides_unread_bytes_to_front() {
        let mut pool = BufferPool::new(None);
        let mut buf = pool.allocate(16);
        buf.extend_from_slice(b"hello world");
        buf.mark_read(6);
        buf.compact();
        assert_eq!(buf.as_read_slice(), b"world");
    }
}
