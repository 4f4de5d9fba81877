//! # Spare Buffer Pool
//!
//! A bounded pool of page-sized scratch buffers shared by compaction
//! operations. `take` blocks while the pool is empty; buffers are always
//! returned with `put`, including the old page buffer a compaction swapped
//! out, so the population is constant and a waiter always wakes.
//!
//! ## Thread Safety
//!
//! A single `parking_lot` mutex guards the stack of buffers; a condvar
//! parks takers while the pool is drained. Compaction holds a buffer for
//! the duration of one node rebuild, so contention is short.

use parking_lot::{Condvar, Mutex};

pub struct BufferPool {
    buffers: Mutex<Vec<Box<[u8]>>>,
    available: Condvar,
    buffer_size: usize,
}

impl BufferPool {
    /// Creates a pool of `count` buffers of `buffer_size` bytes each.
    pub fn new(buffer_size: usize, count: usize) -> Self {
        let buffers = (0..count.max(1))
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect();
        Self {
            buffers: Mutex::new(buffers),
            available: Condvar::new(),
            buffer_size,
        }
    }

    /// Takes a buffer, blocking until one is available.
    pub fn take(&self) -> Box<[u8]> {
        let mut guard = self.buffers.lock();
        while guard.is_empty() {
            self.available.wait(&mut guard);
        }
        guard.pop().unwrap()
    }

    /// Returns a buffer to the pool and wakes one waiter.
    pub fn put(&self, buffer: Box<[u8]>) {
        debug_assert_eq!(buffer.len(), self.buffer_size);
        self.buffers.lock().push(buffer);
        self.available.notify_one();
    }

    /// Buffers currently idle in the pool.
    pub fn available(&self) -> usize {
        self.buffers.lock().len()
    }
}
