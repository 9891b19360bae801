//! Pool of activity record buffers
//!
//! The driver asks for empty buffers to fill with activity records and hands
//! them back once full. Buffers are recycled through a lock-free free list so
//! steady-state tracing does not hit the allocator.

use crossbeam::queue::SegQueue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default size of one activity buffer
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Smallest buffer size accepted by configuration
pub const MIN_BUFFER_SIZE: usize = 1024;

/// Configuration for the activity buffer pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferPoolConfig {
    /// Size in bytes of every pooled buffer
    pub buffer_size_bytes: usize,
    /// Upper bound on buffers alive at once (0 = unbounded)
    pub max_buffers: usize,
    /// Buffers allocated up front
    pub preallocate: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            buffer_size_bytes: DEFAULT_BUFFER_SIZE,
            max_buffers: 0,
            preallocate: 0,
        }
    }
}

impl BufferPoolConfig {
    pub fn new(buffer_size_bytes: usize) -> Self {
        BufferPoolConfig {
            buffer_size_bytes,
            ..Default::default()
        }
    }

    /// Cap the number of live buffers
    pub fn with_max_buffers(mut self, max_buffers: usize) -> Self {
        self.max_buffers = max_buffers;
        self
    }
}

/// Byte buffer lent to the driver; an empty buffer means "none available"
#[derive(Debug, Default)]
pub struct ActivityBuffer {
    data: Box<[u8]>,
}

impl ActivityBuffer {
    pub fn empty() -> Self {
        Self::default()
    }

    fn zeroed(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Thread-safe pool of fixed-size activity buffers
pub struct BufferPool {
    config: BufferPoolConfig,
    free: SegQueue<ActivityBuffer>,
    allocated: AtomicUsize,
    acquired: AtomicUsize,
    reused: AtomicUsize,
    reclaimed: AtomicUsize,
    exhausted: AtomicUsize,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Self {
        let pool = BufferPool {
            free: SegQueue::new(),
            allocated: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
            reclaimed: AtomicUsize::new(0),
            exhausted: AtomicUsize::new(0),
            config,
        };
        for _ in 0..pool.config.preallocate {
            if let Some(buffer) = pool.allocate() {
                pool.free.push(buffer);
            }
        }
        pool
    }

    /// Take a free buffer, allocating one if the pool is under its cap
    pub fn get_or_create(&self) -> Option<ActivityBuffer> {
        if let Some(buffer) = self.free.pop() {
            self.acquired.fetch_add(1, Ordering::Relaxed);
            self.reused.fetch_add(1, Ordering::Relaxed);
            return Some(buffer);
        }
        match self.allocate() {
            Some(buffer) => {
                self.acquired.fetch_add(1, Ordering::Relaxed);
                Some(buffer)
            }
            None => {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Return a buffer for reuse; buffers of a foreign size are dropped
    pub fn reclaim(&self, buffer: ActivityBuffer) {
        if buffer.len() != self.config.buffer_size_bytes {
            return;
        }
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
        self.free.push(buffer);
    }

    fn allocate(&self) -> Option<ActivityBuffer> {
        let max = self.config.max_buffers;
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .ok()?;
        Some(ActivityBuffer::zeroed(self.config.buffer_size_bytes))
    }

    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size_bytes
    }

    /// Buffers currently sitting in the free list
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            buffer_size: self.config.buffer_size_bytes,
            max_buffers: self.config.max_buffers,
            available: self.free.len(),
            allocated: self.allocated.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub buffer_size: usize,
    pub max_buffers: usize,
    /// Buffers in the free list
    pub available: usize,
    /// Buffers ever allocated
    pub allocated: usize,
    /// Successful acquire operations
    pub acquired: usize,
    /// Acquires served from the free list
    pub reused: usize,
    pub reclaimed: usize,
    /// Acquires refused because the pool was at its cap
    pub exhausted: usize,
}

impl PoolStats {
    /// Percentage of acquires served from the free list
    pub fn hit_rate(&self) -> f64 {
        if self.acquired == 0 {
            return 0.0;
        }
        (self.reused as f64 / self.acquired as f64) * 100.0
    }

    /// Buffers currently lent out
    pub fn outstanding(&self) -> usize {
        self.allocated.saturating_sub(self.available)
    }
}
