//! Per-connection pool of reusable read buffers.
//!
//! Each connection owns its own pool (TLS sessions size it from the record
//! size), so no locking is shared between connections. Buffers are checked
//! out, filled, and either returned whole or split: the filled prefix is
//! frozen and handed upstream while the untouched tail goes back to the pool.
//!
//! # Design
//!
//! - Fixed chunk size per pool
//! - A bounded free list; surplus buffers are simply dropped
//! - Returned buffers with too little spare capacity are discarded

use bytes::{Bytes, BytesMut};

/// Default chunk size: 16KB, one maximum-size TLS record.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Default number of buffers retained on the free list.
pub const DEFAULT_MAX_FREE: usize = 8;

/// A pool of buffers with a fixed target capacity.
///
/// Thread-safety: not thread-safe. Wrap it in a lock owned by the connection.
#[derive(Debug)]
pub struct BufferPool {
    chunk_size: usize,
    max_free: usize,
    free: Vec<BytesMut>,
    checked_out: usize,
}

impl BufferPool {
    /// Create a new pool.
    ///
    /// # Arguments
    /// * `chunk_size` - Capacity of each buffer in bytes
    /// * `max_free` - Number of idle buffers retained for reuse
    pub fn new(chunk_size: usize, max_free: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be positive");
        Self {
            chunk_size,
            max_free,
            free: Vec::with_capacity(max_free),
            checked_out: 0,
        }
    }

    /// Create a pool with default settings (16KB chunks, 8 retained).
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FREE)
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of idle buffers ready for reuse.
    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of buffers currently checked out.
    #[inline]
    pub fn checked_out_count(&self) -> usize {
        self.checked_out
    }

    /// Check out an empty buffer with at least `chunk_size / 2` spare capacity.
    pub fn checkout(&mut self) -> BytesMut {
        self.checked_out += 1;
        match self.free.pop() {
            Some(buf) => buf,
            None => BytesMut::with_capacity(self.chunk_size),
        }
    }

    /// Return a buffer. Its contents are discarded.
    pub fn checkin(&mut self, mut buf: BytesMut) {
        self.checked_out = self.checked_out.saturating_sub(1);
        buf.clear();
        if buf.capacity() >= self.chunk_size / 2 && self.free.len() < self.max_free {
            self.free.push(buf);
        }
    }

    /// Split the first `len` bytes off a checked-out buffer as frozen data
    /// and return the remainder to the pool.
    pub fn split_filled(&mut self, mut buf: BytesMut, len: usize) -> Bytes {
        let filled = buf.split_to(len).freeze();
        self.checkin(buf);
        filled
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_checkin_reuses() {
        let mut pool = BufferPool::new(1024, 2);
        let buf = pool.checkout();
        assert!(buf.capacity() >= 1024);
        assert_eq!(pool.checked_out_count(), 1);

        pool.checkin(buf);
        assert_eq!(pool.checked_out_count(), 0);
        assert_eq!(pool.free_count(), 1);

        let _buf = pool.checkout();
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_free_list_is_bounded() {
        let mut pool = BufferPool::new(64, 1);
        let a = pool.checkout();
        let b = pool.checkout();
        pool.checkin(a);
        pool.checkin(b);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_checkin_clears_contents() {
        let mut pool = BufferPool::new(64, 4);
        let mut buf = pool.checkout();
        buf.extend_from_slice(b"stale");
        pool.checkin(buf);
        assert!(pool.checkout().is_empty());
    }

    #[test]
    fn test_split_filled() {
        let mut pool = BufferPool::new(64, 4);
        let mut buf = pool.checkout();
        buf.resize(64, 0);
        buf[..3].copy_from_slice(b"abc");
        let filled = pool.split_filled(buf, 3);
        assert_eq!(&filled[..], b"abc");
        assert_eq!(pool.checked_out_count(), 0);
        // The 61-byte tail still has enough room to be retained.
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_small_remainders_are_dropped() {
        let mut pool = BufferPool::new(64, 4);
        let mut buf = pool.checkout();
        buf.resize(64, 0);
        let _ = pool.split_filled(buf, 60);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    #[should_panic(expected = "chunk_size must be positive")]
    fn test_zero_chunk_size_panics() {
        let _ = BufferPool::new(0, 1);
    }
}
