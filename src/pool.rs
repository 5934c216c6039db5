//! Reusable fixed-size read buffers.
//!
//! The I/O loop stages socket reads through a pooled buffer instead of
//! allocating per read. Handles return their buffer on drop; when the free
//! list is empty a new buffer is allocated and joins the pool on release, so
//! the pool only ever grows.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};

/// Thread-safe pool of equally sized byte buffers.
pub struct BufferPool {
    buf_size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    /// Creates a pool of `initial_count` buffers of `buf_size` bytes each.
    pub fn new(buf_size: usize, initial_count: usize) -> Self {
        let free = (0..initial_count)
            .map(|_| vec![0u8; buf_size].into_boxed_slice())
            .collect();
        Self {
            buf_size,
            free: Mutex::new(free),
        }
    }

    /// Takes a buffer out of the pool, allocating a fresh one on exhaustion.
    pub fn acquire(&self) -> PooledBuf<'_> {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buf_size].into_boxed_slice());
        PooledBuf {
            pool: self,
            buf: Some(buf),
        }
    }

    /// Size of each buffer in bytes.
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Number of buffers currently free.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    fn release(&self, buf: Box<[u8]>) {
        self.free.lock().push(buf);
    }
}

/// Scoped handle over a pooled buffer; returns it to the pool on drop.
pub struct PooledBuf<'a> {
    pool: &'a BufferPool,
    buf: Option<Box<[u8]>>,
}

impl Deref for PooledBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_release_accounting() {
        let pool = BufferPool::new(1024, 4);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.buf_size(), 1024);

        {
            let first = pool.acquire();
            let second = pool.acquire();
            assert_eq!(first.len(), 1024);
            assert_eq!(second.len(), 1024);
            assert_eq!(pool.available(), 2);
        }
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_pool_grows_on_exhaustion() {
        let pool = BufferPool::new(64, 1);
        let first = pool.acquire();
        let second = pool.acquire();
        assert_eq!(pool.available(), 0);
        drop(first);
        drop(second);
        // The overflow allocation stays with the pool.
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_buffers_are_writable() {
        let pool = BufferPool::new(16, 1);
        let mut buf = pool.acquire();
        buf[0] = 0xAB;
        buf[15] = 0xCD;
        assert_eq!(buf[0], 0xAB);
        assert_eq!(buf[15], 0xCD);
    }

    #[test]
    fn test_concurrent_handles_are_exclusive() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 200;

        let pool = Arc::new(BufferPool::new(32, 2));
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for round in 0..ROUNDS {
                    let mut buf = pool.acquire();
                    let tag = (t * ROUNDS + round) as u8;
                    buf.fill(tag);
                    // No other thread may touch this buffer while held.
                    assert!(buf.iter().all(|byte| *byte == tag));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Every scoped handle has dropped; all buffers are back.
        assert!(pool.available() >= 2);
    }
}
