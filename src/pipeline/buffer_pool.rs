//! Fixed pool of large reusable byte buffers.
//!
//! Volume downloads and decompression need buffers in the 100 MB class;
//! allocating them per item would thrash the allocator and let a burst of
//! work exhaust memory. The pool bounds concurrency by construction:
//! `acquire` blocks until a buffer is free, and the returned lease gives the
//! buffer back on every exit path.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct PoolInner {
    available: Mutex<Vec<Vec<u8>>>,
    ready: Condvar,
    buffer_capacity: usize,
}

/// Bounded pool of byte buffers with blocking acquire.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Allocate `num_buffers` buffers, each with `buffer_capacity` bytes
    /// reserved up front.
    pub fn new(num_buffers: usize, buffer_capacity: usize) -> Self {
        let mut buffers = Vec::with_capacity(num_buffers);
        for _ in 0..num_buffers {
            buffers.push(Vec::with_capacity(buffer_capacity));
        }
        BufferPool {
            inner: Arc::new(PoolInner {
                available: Mutex::new(buffers),
                ready: Condvar::new(),
                buffer_capacity,
            }),
        }
    }

    /// Take exclusive use of a buffer, blocking until one is free. The
    /// buffer arrives cleared with its capacity preserved.
    pub fn acquire(&self) -> PooledBuffer {
        let mut available = self.inner.available.lock();
        while available.is_empty() {
            self.inner.ready.wait(&mut available);
        }
        let mut buffer = available.pop().expect("non-empty after wait");
        buffer.clear();
        PooledBuffer {
            pool: Arc::clone(&self.inner),
            buffer: Some(buffer),
        }
    }

    /// Buffers currently free.
    pub fn available(&self) -> usize {
        self.inner.available.lock().len()
    }

    /// Reserved capacity of each buffer.
    pub fn buffer_capacity(&self) -> usize {
        self.inner.buffer_capacity
    }
}

/// Exclusive lease on a pooled buffer; returns it to the pool on drop.
pub struct PooledBuffer {
    pool: Arc<PoolInner>,
    buffer: Option<Vec<u8>>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        self.buffer.as_ref().expect("buffer held until drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buffer.as_mut().expect("buffer held until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.available.lock().push(buffer);
            self.pool.ready.notify_one();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_acquire_release_cycle() {
        let pool = BufferPool::new(2, 1024);
        assert_eq!(pool.available(), 2);

        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_capacity_preserved_length_reset() {
        let pool = BufferPool::new(1, 4096);
        {
            let mut buffer = pool.acquire();
            buffer.extend_from_slice(&[1u8; 100]);
            assert_eq!(buffer.len(), 100);
        }
        let buffer = pool.acquire();
        assert_eq!(buffer.len(), 0);
        assert!(buffer.capacity() >= 4096);
    }

    #[test]
    fn test_blocking_acquire_wakes_on_release() {
        let pool = BufferPool::new(1, 64);
        let held = pool.acquire();

        let pool_clone = pool.clone();
        let waiter = std::thread::spawn(move || {
            let buffer = pool_clone.acquire();
            buffer.capacity()
        });

        // Give the waiter time to block, then free the buffer
        std::thread::sleep(Duration::from_millis(50));
        drop(held);

        assert!(waiter.join().unwrap() >= 64);
    }

    #[test]
    fn test_many_threads_contending() {
        let pool = BufferPool::new(4, 256);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let mut buffer = pool.acquire();
                    buffer.push(1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.available(), 4);
    }
}
