//! Process-wide GPU buffer pool, keyed by `(size_class, usage)`.
//!
//! Thread-safe: the pool may be shared across pipeline instances (§5), so
//! its free lists live behind a `parking_lot::Mutex` rather than being
//! pipeline-owned. Handles it hands out are mutably owned by exactly one
//! caller until released back to the pool.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use runner_backend::device::{BufferHandle, BufferUsage, ComputeBackend, SizeClass};

#[derive(Debug, Clone, Copy, Default)]
pub struct ClassStats {
    pub allocated: usize,
    pub in_use: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub current_bytes: usize,
    pub peak_bytes: usize,
    pub per_class: HashMap<(SizeClass, ), ClassStats>,
}

struct Inner {
    free: HashMap<(SizeClass, BufferUsage), Vec<BufferHandle>>,
    current_bytes: usize,
    peak_bytes: usize,
    per_class: HashMap<SizeClass, ClassStats>,
}

/// Hands out and reclaims device buffers. A size/usage pair with a free
/// buffer available is reused instead of allocating; otherwise the
/// underlying [`ComputeBackend`] is asked for a fresh one.
pub struct BufferPool {
    device: Arc<dyn ComputeBackend>,
    inner: Mutex<Inner>,
}

impl BufferPool {
    pub fn new(device: Arc<dyn ComputeBackend>) -> Arc<Self> {
        Arc::new(Self {
            device,
            inner: Mutex::new(Inner {
                free: HashMap::new(),
                current_bytes: 0,
                peak_bytes: 0,
                per_class: HashMap::new(),
            }),
        })
    }

    pub fn device(&self) -> &Arc<dyn ComputeBackend> { &self.device }

    pub fn acquire(&self, bytes: usize, usage: BufferUsage) -> BufferHandle {
        let size_class = SizeClass::for_bytes(bytes);
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.free.get_mut(&(size_class, usage)).and_then(|v| v.pop()) {
            let stats = inner.per_class.entry(size_class).or_default();
            stats.in_use += 1;
            return handle;
        }
        let handle = self.device.alloc(size_class, usage);
        inner.current_bytes += size_class.0;
        inner.peak_bytes = inner.peak_bytes.max(inner.current_bytes);
        let stats = inner.per_class.entry(size_class).or_default();
        stats.allocated += 1;
        stats.in_use += 1;
        handle
    }

    pub fn release(&self, bytes: usize, usage: BufferUsage, handle: BufferHandle) {
        let size_class = SizeClass::for_bytes(bytes);
        let mut inner = self.inner.lock();
        inner.free.entry((size_class, usage)).or_default().push(handle);
        if let Some(stats) = inner.per_class.get_mut(&size_class) {
            stats.in_use = stats.in_use.saturating_sub(1);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            current_bytes: inner.current_bytes,
            peak_bytes: inner.peak_bytes,
            per_class: inner.per_class.iter().map(|(k, v)| ((*k,), *v)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_backend::device::SimulatedDevice;

    #[test]
    fn reuses_released_buffer_of_same_class() {
        let dev: Arc<dyn ComputeBackend> = Arc::new(SimulatedDevice::new(4, 8, 1));
        let pool = BufferPool::new(dev);
        let a = pool.acquire(256, BufferUsage::Storage);
        pool.release(256, BufferUsage::Storage, a);
        let b = pool.acquire(256, BufferUsage::Storage);
        assert_eq!(a, b);
        let stats = pool.stats();
        assert_eq!(stats.current_bytes, 256);
    }

    #[test]
    fn distinct_usage_does_not_share_free_list() {
        let dev: Arc<dyn ComputeBackend> = Arc::new(SimulatedDevice::new(4, 8, 1));
        let pool = BufferPool::new(dev);
        let a = pool.acquire(256, BufferUsage::Storage);
        pool.release(256, BufferUsage::Storage, a);
        let b = pool.acquire(256, BufferUsage::Staging);
        assert_ne!(a, b);
    }
}
