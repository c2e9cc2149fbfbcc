//! Reusable byte buffers for decoding inbound frames.
//!
//! Encoders draw message bodies from a [`BufferPool`] so a steady stream of
//! similarly sized frames does not allocate on every delivery. Buffers larger
//! than `max_buffer_size` are never retained.

use parking_lot::Mutex;

/// Bounded pool of byte buffers.
///
/// Thread-safe: broker delivery threads take buffers while application
/// threads return them.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_buffers: usize,
    max_buffer_size: usize,
}

impl BufferPool {
    /// Create a pool retaining at most `max_buffers` buffers of at most
    /// `max_buffer_size` bytes capacity each.
    pub fn new(max_buffers: usize, max_buffer_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_buffers)),
            max_buffers,
            max_buffer_size,
        }
    }

    /// Take an empty buffer with at least `min_capacity` bytes of capacity.
    pub fn take(&self, min_capacity: usize) -> Vec<u8> {
        let reused = {
            let mut free = self.free.lock();
            free.iter()
                .position(|buf| buf.capacity() >= min_capacity)
                .map(|index| free.swap_remove(index))
        };

        match reused {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(min_capacity),
        }
    }

    /// Return a buffer to the pool.
    ///
    /// Dropped instead if the pool is full or the buffer is oversized.
    pub fn give_back(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.max_buffer_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_buffers {
            buf.clear();
            free.push(buf);
        }
    }

    /// Number of buffers currently retained.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Largest buffer capacity the pool retains.
    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64, 64 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_from_empty_pool_allocates() {
        let pool = BufferPool::new(4, 1024);
        let buf = pool.take(128);
        assert!(buf.capacity() >= 128);
        assert!(buf.is_empty());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_returned_buffer_is_reused_and_cleared() {
        let pool = BufferPool::new(4, 1024);
        let mut buf = pool.take(256);
        buf.extend_from_slice(b"stale");
        let ptr = buf.as_ptr();
        pool.give_back(buf);
        assert_eq!(pool.available(), 1);

        let again = pool.take(16);
        assert!(again.is_empty());
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_oversized_buffer_is_dropped() {
        let pool = BufferPool::new(4, 64);
        pool.give_back(Vec::with_capacity(4096));
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = BufferPool::new(2, 1024);
        for _ in 0..5 {
            pool.give_back(Vec::with_capacity(32));
        }
        assert_eq!(pool.available(), 2);
    }
}
