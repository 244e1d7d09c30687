//! Pooled compute buffers with leak accounting.
//!
//! Buffers are leased from a pool keyed by power-of-two size class and a
//! purpose label. A lease returns its backing storage to the pool on drop,
//! so weight buffers (session lifetime, held by the loader) and activation
//! buffers (step lifetime) share one accounting surface. `outstanding()`
//! is the leak-check hook asserted at unload.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Shared buffer pool. Cloning shares the underlying free lists.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<PoolInner>>,
}

struct PoolInner {
    /// Free storage per size class.
    free: HashMap<usize, Vec<Vec<f32>>>,

    /// Leases currently out, per purpose label.
    outstanding: HashMap<&'static str, usize>,

    /// Lifetime counters.
    total_acquired: u64,
    total_reused: u64,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                free: HashMap::new(),
                outstanding: HashMap::new(),
                total_acquired: 0,
                total_reused: 0,
            })),
        }
    }

    /// Lease a zeroed buffer of at least `len` elements.
    pub fn acquire(&self, len: usize, label: &'static str) -> PooledBuffer {
        let class = size_class(len);
        let mut inner = self.inner.lock().expect("buffer pool poisoned");
        inner.total_acquired += 1;

        let mut data = match inner.free.get_mut(&class).and_then(Vec::pop) {
            Some(buf) => {
                inner.total_reused += 1;
                buf
            }
            None => Vec::with_capacity(class),
        };
        data.clear();
        data.resize(len, 0.0);

        *inner.outstanding.entry(label).or_insert(0) += 1;
        drop(inner);

        PooledBuffer {
            pool: self.clone(),
            data,
            class,
            label,
        }
    }

    /// Lease a buffer initialized from a slice.
    pub fn acquire_from(&self, src: &[f32], label: &'static str) -> PooledBuffer {
        let mut buf = self.acquire(src.len(), label);
        buf.data.copy_from_slice(src);
        buf
    }

    /// Total leases currently out across all labels.
    pub fn outstanding(&self) -> usize {
        let inner = self.inner.lock().expect("buffer pool poisoned");
        inner.outstanding.values().sum()
    }

    /// Per-label breakdown of leases currently out.
    pub fn outstanding_by_label(&self) -> Vec<(&'static str, usize)> {
        let inner = self.inner.lock().expect("buffer pool poisoned");
        let mut counts: Vec<_> = inner
            .outstanding
            .iter()
            .filter(|(_, &n)| n > 0)
            .map(|(&l, &n)| (l, n))
            .collect();
        counts.sort_unstable();
        counts
    }

    /// Fraction of acquisitions served from the free lists.
    pub fn reuse_rate(&self) -> f64 {
        let inner = self.inner.lock().expect("buffer pool poisoned");
        if inner.total_acquired == 0 {
            return 0.0;
        }
        inner.total_reused as f64 / inner.total_acquired as f64
    }

    fn release(&self, data: Vec<f32>, class: usize, label: &'static str) {
        let mut inner = self.inner.lock().expect("buffer pool poisoned");
        if let Some(count) = inner.outstanding.get_mut(label) {
            *count = count.saturating_sub(1);
        }
        inner.free.entry(class).or_default().push(data);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A leased buffer. Dereferences to its element slice; the backing storage
/// returns to the pool on drop.
pub struct PooledBuffer {
    pool: BufferPool,
    data: Vec<f32>,
    class: usize,
    label: &'static str,
}

impl PooledBuffer {
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.data
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        debug!(label = self.label, len = data.len(), "buffer returned to pool");
        self.pool.release(data, self.class, self.label);
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("label", &self.label)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Round a length up to its power-of-two size class.
fn size_class(len: usize) -> usize {
    len.max(1).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_accounting() {
        let pool = BufferPool::new();
        let a = pool.acquire(100, "activation");
        let b = pool.acquire(64, "weight");
        assert_eq!(pool.outstanding(), 2);

        drop(a);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.outstanding_by_label(), vec![("weight", 1)]);

        drop(b);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_reuse_same_class() {
        let pool = BufferPool::new();
        drop(pool.acquire(100, "activation"));
        let again = pool.acquire(120, "activation"); // same class (128)
        assert_eq!(again.len(), 120);
        assert!(pool.reuse_rate() > 0.0);
    }

    #[test]
    fn test_acquired_buffers_are_zeroed() {
        let pool = BufferPool::new();
        {
            let mut buf = pool.acquire(8, "activation");
            buf.copy_from_slice(&[1.0; 8]);
        }
        let buf = pool.acquire(8, "activation");
        assert!(buf.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_acquire_from_copies() {
        let pool = BufferPool::new();
        let src = [1.0, 2.0, 3.0];
        let buf = pool.acquire_from(&src, "weight");
        assert_eq!(&buf[..], &src);
    }
}
