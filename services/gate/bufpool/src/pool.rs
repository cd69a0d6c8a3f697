//! Buffer pool with checkout/return ownership and usage statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::Buffer;

/// Default cap on idle buffers retained for reuse
const DEFAULT_MAX_IDLE: usize = 256;

/// Usage counters for a [`BufferPool`]; observability only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Buffers handed out
    pub gets: u64,
    /// Buffers returned
    pub puts: u64,
    /// Gets that had to allocate because the pool was empty
    pub misses: u64,
    /// Buffers currently idle in the pool
    pub idle: usize,
}

/// A pool of reusable [`Buffer`]s.
///
/// `get` hands out an idle buffer or allocates a fresh one; `put` returns
/// ownership for reuse. Buffers beyond the idle cap are dropped instead of
/// retained.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Buffer>>,
    max_idle: usize,
    gets: AtomicU64,
    puts: AtomicU64,
    misses: AtomicU64,
}

impl BufferPool {
    /// Create an empty pool with the default idle cap
    pub fn new() -> Self {
        Self::with_max_idle(DEFAULT_MAX_IDLE)
    }

    /// Create an empty pool retaining at most `max_idle` idle buffers
    pub fn with_max_idle(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_idle,
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Check a buffer out of the pool, allocating if none is idle
    pub fn get(&self) -> Buffer {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let reused = lock(&self.free).pop();
        match reused {
            Some(buf) => buf,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Buffer::new()
            }
        }
    }

    /// Return a buffer to the pool.
    ///
    /// The caller must not retain any view of the buffer: the same storage
    /// may be handed to another reader immediately.
    pub fn put(&self, mut buffer: Buffer) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        buffer.clear();

        let mut free = lock(&self.free);
        if free.len() < self.max_idle {
            free.push(buffer);
        } else {
            debug!(max_idle = self.max_idle, "buffer pool full, dropping buffer");
        }
    }

    /// Snapshot the pool's usage counters
    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            idle: lock(&self.free).len(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(free: &Mutex<Vec<Buffer>>) -> std::sync::MutexGuard<'_, Vec<Buffer>> {
    free.lock().unwrap_or_else(|e| e.into_inner())
}
