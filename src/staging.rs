//! Lock-free pool of reusable host staging buffers.
//!
//! The hierarchical reduction path round-trips each rank's owned byte range
//! through a host buffer every cycle; recycling those allocations keeps the
//! steady-state loop allocation-free.

use crossbeam_queue::ArrayQueue;

/// Number of pooled buffers. Two is enough for the background thread's
/// in-flight set (shard + remainder), the rest is headroom for compression.
const POOL_SLOTS: usize = 8;

/// Buffers that have grown beyond this are dropped instead of returned.
const MAX_RETAINED_CAPACITY: usize = 64 * 1024 * 1024;

pub struct StagingPool {
    bufs: ArrayQueue<Vec<u8>>,
}

impl Default for StagingPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StagingPool {
    pub fn new() -> Self {
        Self {
            bufs: ArrayQueue::new(POOL_SLOTS),
        }
    }

    /// Check out a zeroed buffer of exactly `len` bytes.
    pub fn get(&self, len: usize) -> Vec<u8> {
        let mut buf = self.bufs.pop().unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    /// Return a buffer to the pool. Oversized buffers are dropped.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.capacity() <= MAX_RETAINED_CAPACITY {
            let _ = self.bufs.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_is_zeroed_after_reuse() {
        let pool = StagingPool::new();
        let mut buf = pool.get(8);
        buf.copy_from_slice(&[0xFF; 8]);
        pool.put(buf);

        let buf = pool.get(8);
        assert_eq!(buf, vec![0u8; 8]);
    }

    #[test]
    fn test_reuse_keeps_capacity() {
        let pool = StagingPool::new();
        let buf = pool.get(1024);
        let ptr = buf.as_ptr();
        pool.put(buf);
        let buf = pool.get(512);
        assert_eq!(buf.as_ptr(), ptr);
    }

    #[test]
    fn test_oversized_buffers_dropped() {
        let pool = StagingPool::new();
        let buf = vec![0u8; MAX_RETAINED_CAPACITY + 1];
        pool.put(buf);
        // Pool stays empty; next get allocates fresh.
        let buf = pool.get(4);
        assert_eq!(buf.len(), 4);
    }
}
