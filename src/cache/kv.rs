//! Per-layer key/value cache.
//!
//! One cache type covers three layouts, chosen at construction:
//! contiguous (preallocated, zero-copy reads), paged (lazily allocated
//! fixed-size pages for long contexts), and sliding window (contiguous
//! storage that shifts left once the window fills). Clones are deep and
//! always contiguous so the speculative decoder can roll back cheaply.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;
use crate::error::{EngineError, EngineResult};

/// Cache storage layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheLayout {
    Contiguous,
    Paged { page_size: usize },
    SlidingWindow { window: usize },
}

impl CacheLayout {
    /// Pick a layout: a declared sliding window wins; otherwise paged for
    /// long contexts, contiguous for short ones.
    pub fn choose(max_seq_len: usize, sliding_window: Option<usize>, config: &CacheConfig) -> Self {
        if let Some(window) = sliding_window {
            CacheLayout::SlidingWindow { window }
        } else if max_seq_len > config.contiguous_threshold {
            CacheLayout::Paged {
                page_size: config.page_size,
            }
        } else {
            CacheLayout::Contiguous
        }
    }
}

/// Per-layer storage: one flat buffer, or lazily allocated pages.
#[derive(Debug, Clone)]
enum LayerStore {
    Contig(Vec<f32>),
    Paged {
        pages: Vec<Option<Box<[f32]>>>,
        page_size: usize,
    },
}

impl LayerStore {
    fn new(layout: CacheLayout, max_seq_len: usize, kv_size: usize) -> Self {
        match layout {
            CacheLayout::Contiguous => LayerStore::Contig(vec![0.0; max_seq_len * kv_size]),
            CacheLayout::SlidingWindow { window } => {
                LayerStore::Contig(vec![0.0; window.min(max_seq_len) * kv_size])
            }
            CacheLayout::Paged { page_size } => LayerStore::Paged {
                pages: vec![None; max_seq_len.div_ceil(page_size)],
                page_size,
            },
        }
    }

    /// Write `tokens` positions starting at `pos` (physical).
    fn write(&mut self, pos: usize, data: &[f32], kv_size: usize) {
        match self {
            LayerStore::Contig(buf) => {
                buf[pos * kv_size..pos * kv_size + data.len()].copy_from_slice(data);
            }
            LayerStore::Paged { pages, page_size } => {
                let page_size = *page_size;
                let tokens = data.len() / kv_size;
                for t in 0..tokens {
                    let logical = pos + t;
                    let page_idx = logical / page_size;
                    let offset = (logical % page_size) * kv_size;
                    let page = pages[page_idx]
                        .get_or_insert_with(|| vec![0.0; page_size * kv_size].into_boxed_slice());
                    page[offset..offset + kv_size]
                        .copy_from_slice(&data[t * kv_size..(t + 1) * kv_size]);
                }
            }
        }
    }

    /// Read positions `[start, end)` (physical). Contiguous storage
    /// borrows; paged storage assembles a copy.
    fn read(&self, start: usize, end: usize, kv_size: usize) -> Cow<'_, [f32]> {
        match self {
            LayerStore::Contig(buf) => Cow::Borrowed(&buf[start * kv_size..end * kv_size]),
            LayerStore::Paged { pages, page_size } => {
                let mut out = vec![0.0; (end - start) * kv_size];
                for t in 0..end - start {
                    let logical = start + t;
                    let page_idx = logical / page_size;
                    let offset = (logical % page_size) * kv_size;
                    if let Some(page) = &pages[page_idx] {
                        out[t * kv_size..(t + 1) * kv_size]
                            .copy_from_slice(&page[offset..offset + kv_size]);
                    }
                }
                Cow::Owned(out)
            }
        }
    }

    /// Shift contents left by `shift` positions (sliding window).
    fn shift_left(&mut self, shift: usize, fill: usize, kv_size: usize) {
        if let LayerStore::Contig(buf) = self {
            buf.copy_within(shift * kv_size..fill * kv_size, 0);
        }
    }

    fn clear(&mut self) {
        match self {
            LayerStore::Contig(buf) => buf.fill(0.0),
            // Page allocations are kept for reuse; stale contents are
            // overwritten before they become readable again.
            LayerStore::Paged { .. } => {}
        }
    }
}

/// Per-layer key/value cache with a global sequence cursor.
#[derive(Debug, Clone)]
pub struct KvCache {
    layout: CacheLayout,
    layers: usize,
    kv_heads: usize,
    head_dim: usize,
    max_seq_len: usize,

    keys: Vec<LayerStore>,
    values: Vec<LayerStore>,
    fill: Vec<usize>,
    current_seq_len: usize,
}

impl KvCache {
    pub fn new(
        layers: usize,
        kv_heads: usize,
        head_dim: usize,
        max_seq_len: usize,
        layout: CacheLayout,
    ) -> Self {
        let kv_size = kv_heads * head_dim;
        Self {
            layout,
            layers,
            kv_heads,
            head_dim,
            max_seq_len,
            keys: (0..layers)
                .map(|_| LayerStore::new(layout, max_seq_len, kv_size))
                .collect(),
            values: (0..layers)
                .map(|_| LayerStore::new(layout, max_seq_len, kv_size))
                .collect(),
            fill: vec![0; layers],
            current_seq_len: 0,
        }
    }

    /// Elements per token per tensor (heads × head_dim).
    pub fn kv_size(&self) -> usize {
        self.kv_heads * self.head_dim
    }

    pub fn layout(&self) -> CacheLayout {
        self.layout
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn current_seq_len(&self) -> usize {
        self.current_seq_len
    }

    /// Occupied length of one layer.
    pub fn fill(&self, layer: usize) -> usize {
        self.fill[layer]
    }

    /// Write `keys`/`values` for new tokens at `start_pos`.
    ///
    /// In the sliding-window layout, writes past the window shift every
    /// buffer of the layer left by the smallest amount that fits and the
    /// sequence cursor drops by the same shift. The global cursor
    /// advances once the last layer is written.
    pub fn update(
        &mut self,
        layer: usize,
        keys: &[f32],
        values: &[f32],
        start_pos: usize,
    ) -> EngineResult<()> {
        let kv_size = self.kv_size();
        debug_assert_eq!(keys.len(), values.len());
        debug_assert_eq!(keys.len() % kv_size, 0);
        let new_tokens = keys.len() / kv_size;

        if start_pos + new_tokens > self.max_seq_len {
            return Err(EngineError::CacheOverflow {
                position: start_pos,
                count: new_tokens,
                max_seq_len: self.max_seq_len,
            });
        }

        let (write_pos, shift) = match self.layout {
            CacheLayout::SlidingWindow { window } if start_pos + new_tokens > window => {
                let shift = start_pos + new_tokens - window;
                let fill = self.fill[layer];
                self.keys[layer].shift_left(shift, fill, kv_size);
                self.values[layer].shift_left(shift, fill, kv_size);
                (start_pos - shift, shift)
            }
            _ => (start_pos, 0),
        };

        self.keys[layer].write(write_pos, keys, kv_size);
        self.values[layer].write(write_pos, values, kv_size);
        self.fill[layer] = self.fill[layer].max(write_pos + new_tokens).min(
            match self.layout {
                CacheLayout::SlidingWindow { window } => window,
                _ => self.max_seq_len,
            },
        );

        if layer == self.layers - 1 {
            self.current_seq_len = if shift > 0 {
                start_pos + new_tokens - shift
            } else {
                self.current_seq_len.max(start_pos + new_tokens)
            };
        }
        Ok(())
    }

    /// Slices `[start, end)` of one layer's keys and values.
    pub fn get(&self, layer: usize, start: usize, end: usize) -> (Cow<'_, [f32]>, Cow<'_, [f32]>) {
        let kv_size = self.kv_size();
        (
            self.keys[layer].read(start, end, kv_size),
            self.values[layer].read(start, end, kv_size),
        )
    }

    /// Deep copy. The clone is always contiguous regardless of the source
    /// layout; the speculative decoder rolls back by dropping it.
    pub fn clone_cache(&self) -> KvCache {
        let kv_size = self.kv_size();
        let mut clone = KvCache::new(
            self.layers,
            self.kv_heads,
            self.head_dim,
            self.max_seq_len,
            CacheLayout::Contiguous,
        );
        for layer in 0..self.layers {
            let fill = self.fill[layer];
            if fill > 0 {
                let (k, v) = self.get(layer, 0, fill);
                clone.keys[layer].write(0, &k, kv_size);
                clone.values[layer].write(0, &v, kv_size);
            }
            clone.fill[layer] = fill;
        }
        clone.current_seq_len = self.current_seq_len;
        clone
    }

    /// Lower every layer's fill (and the cursor) to at most `len`.
    /// Memory is not released.
    pub fn truncate(&mut self, len: usize) {
        for fill in &mut self.fill {
            *fill = (*fill).min(len);
        }
        self.current_seq_len = self.current_seq_len.min(len);
    }

    /// Reset to empty. The paged layout keeps its page allocations.
    pub fn clear(&mut self) {
        for store in self.keys.iter_mut().chain(self.values.iter_mut()) {
            store.clear();
        }
        self.fill.fill(0);
        self.current_seq_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_data(kv_size: usize, seed: f32) -> Vec<f32> {
        (0..kv_size).map(|i| seed + i as f32 * 0.01).collect()
    }

    #[test]
    fn test_layout_choice() {
        let config = CacheConfig::default();
        assert_eq!(
            CacheLayout::choose(2048, None, &config),
            CacheLayout::Contiguous
        );
        assert_eq!(
            CacheLayout::choose(8192, None, &config),
            CacheLayout::Paged { page_size: 256 }
        );
        assert_eq!(
            CacheLayout::choose(8192, Some(1024), &config),
            CacheLayout::SlidingWindow { window: 1024 }
        );
    }

    #[test]
    fn test_update_get_roundtrip() {
        // Slice consistency: what goes in at start comes back bit-exact.
        let mut cache = KvCache::new(2, 2, 4, 16, CacheLayout::Contiguous);
        let kv = cache.kv_size();
        let k: Vec<f32> = (0..3 * kv).map(|i| i as f32).collect();
        let v: Vec<f32> = (0..3 * kv).map(|i| -(i as f32)).collect();

        cache.update(0, &k, &v, 0).unwrap();
        let (got_k, got_v) = cache.get(0, 0, 3);
        assert_eq!(&got_k[..], &k[..]);
        assert_eq!(&got_v[..], &v[..]);

        // Partial slice.
        let (got_k, _) = cache.get(0, 1, 3);
        assert_eq!(&got_k[..], &k[kv..]);
    }

    #[test]
    fn test_paged_roundtrip_across_pages() {
        let mut cache = KvCache::new(1, 1, 4, 1024, CacheLayout::Paged { page_size: 4 });
        let kv = cache.kv_size();
        // 10 tokens spans three pages.
        let k: Vec<f32> = (0..10 * kv).map(|i| i as f32).collect();
        cache.update(0, &k, &k, 0).unwrap();

        let (got_k, _) = cache.get(0, 2, 9);
        assert_eq!(&got_k[..], &k[2 * kv..9 * kv]);
    }

    #[test]
    fn test_cursor_advances_on_last_layer() {
        let mut cache = KvCache::new(2, 1, 2, 8, CacheLayout::Contiguous);
        let data = token_data(2, 1.0);
        cache.update(0, &data, &data, 0).unwrap();
        assert_eq!(cache.current_seq_len(), 0); // only layer 0 updated
        cache.update(1, &data, &data, 0).unwrap();
        assert_eq!(cache.current_seq_len(), 1);
    }

    #[test]
    fn test_overflow() {
        // max_seq_len = 4, writing 2 tokens at position 3 must fail.
        let mut cache = KvCache::new(1, 1, 2, 4, CacheLayout::Contiguous);
        let data = token_data(4, 0.0);
        let err = cache.update(0, &data, &data, 3).unwrap_err();
        assert!(matches!(
            err,
            EngineError::CacheOverflow {
                position: 3,
                count: 2,
                max_seq_len: 4
            }
        ));
    }

    #[test]
    fn test_clone_isolation() {
        let mut cache = KvCache::new(1, 1, 2, 8, CacheLayout::Contiguous);
        let a = token_data(2, 1.0);
        cache.update(0, &a, &a, 0).unwrap();

        let snapshot = cache.clone_cache();
        let b = token_data(2, 99.0);
        cache.update(0, &b, &b, 0).unwrap(); // overwrite position 0

        let (clone_k, _) = snapshot.get(0, 0, 1);
        assert_eq!(&clone_k[..], &a[..]);
        let (orig_k, _) = cache.get(0, 0, 1);
        assert_eq!(&orig_k[..], &b[..]);
    }

    #[test]
    fn test_clone_of_paged_is_contiguous() {
        let mut cache = KvCache::new(1, 1, 2, 1024, CacheLayout::Paged { page_size: 4 });
        let data = token_data(2, 3.0);
        cache.update(0, &data, &data, 0).unwrap();
        let clone = cache.clone_cache();
        assert_eq!(clone.layout(), CacheLayout::Contiguous);
        let (k, _) = clone.get(0, 0, 1);
        assert_eq!(&k[..], &data[..]);
    }

    #[test]
    fn test_clone_of_sliding_window_is_contiguous() {
        let mut cache = KvCache::new(1, 1, 2, 64, CacheLayout::SlidingWindow { window: 4 });
        let kv = cache.kv_size();
        let data: Vec<f32> = (0..4 * kv).map(|i| i as f32).collect();
        cache.update(0, &data, &data, 0).unwrap();

        let clone = cache.clone_cache();
        assert_eq!(clone.layout(), CacheLayout::Contiguous);
        assert_eq!(clone.current_seq_len(), 4);
        let (k, v) = clone.get(0, 0, 4);
        assert_eq!(&k[..], &data[..]);
        assert_eq!(&v[..], &data[..]);
    }

    #[test]
    fn test_truncate_keeps_prefix() {
        let mut cache = KvCache::new(1, 1, 2, 8, CacheLayout::Contiguous);
        let kv = cache.kv_size();
        let data: Vec<f32> = (0..4 * kv).map(|i| i as f32).collect();
        cache.update(0, &data, &data, 0).unwrap();
        assert_eq!(cache.current_seq_len(), 4);

        cache.truncate(2);
        assert_eq!(cache.current_seq_len(), 2);
        assert_eq!(cache.fill(0), 2);
        let (k, _) = cache.get(0, 0, 2);
        assert_eq!(&k[..], &data[..2 * kv]);
    }

    #[test]
    fn test_sliding_window_shift() {
        // Window 4, positions 0..3 occupied, one more token at pos 4:
        // everything shifts left by one and the new token lands at
        // physical position 3.
        let mut cache = KvCache::new(1, 1, 2, 64, CacheLayout::SlidingWindow { window: 4 });
        let kv = cache.kv_size();
        let data: Vec<f32> = (0..4 * kv).map(|i| i as f32).collect();
        cache.update(0, &data, &data, 0).unwrap();
        assert_eq!(cache.current_seq_len(), 4);

        let new = token_data(kv, 100.0);
        cache.update(0, &new, &new, 4).unwrap();

        // Position 0 now holds what used to be position 1.
        let (k, _) = cache.get(0, 0, 1);
        assert_eq!(&k[..], &data[kv..2 * kv]);
        // The new token is at position 3.
        let (k, _) = cache.get(0, 3, 4);
        assert_eq!(&k[..], &new[..]);
        // The cursor dropped by the shift.
        assert_eq!(cache.current_seq_len(), 4);
    }

    #[test]
    fn test_clear_resets_fill() {
        let mut cache = KvCache::new(2, 1, 2, 8, CacheLayout::Paged { page_size: 4 });
        let data = token_data(2, 1.0);
        cache.update(0, &data, &data, 0).unwrap();
        cache.update(1, &data, &data, 0).unwrap();
        cache.clear();
        assert_eq!(cache.current_seq_len(), 0);
        assert_eq!(cache.fill(0), 0);
    }
}
