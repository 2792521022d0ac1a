//! Per-layer key/value cache with pluggable layout.
//!
//! Modeled as a sealed variant (design note §9): attention kernels dispatch
//! on `KvCache`'s variant, never on a string tag. Every layout implements
//! the same operations so the pipeline's decode loop doesn't need to know
//! which one is active.

use runner_common::{Result, RunnerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvDtype {
    F16,
    F32,
}

#[derive(Debug, Clone)]
pub struct KvCacheParams {
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub max_seq_len: usize,
    pub kv_dtype: KvDtype,
    pub window_size: Option<usize>,
    pub page_size: Option<usize>,
    pub basis_vocab_size: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum KvView {
    Contiguous { keys: Vec<f32>, values: Vec<f32>, seq_len: usize },
    Paged { pages: Vec<(Vec<f32>, Vec<f32>)>, page_table: Vec<usize>, seq_len: usize, page_size: usize },
    Bdpa {
        basis: Vec<(u32, Vec<f32>, Vec<f32>)>,
        residual_pages: Vec<Vec<i8>>,
        flat_index: Vec<(usize, usize, usize)>,
        num_basis_vectors: usize,
        page_size: usize,
        seq_len: usize,
    },
}

impl KvView {
    pub fn seq_len(&self) -> usize {
        match self {
            KvView::Contiguous { seq_len, .. } => *seq_len,
            KvView::Paged { seq_len, .. } => *seq_len,
            KvView::Bdpa { seq_len, .. } => *seq_len,
        }
    }
}

fn width(p: &KvCacheParams) -> usize { p.num_kv_heads * p.head_dim }

#[derive(Debug, Clone)]
struct ContiguousLayer {
    keys: Vec<f32>,
    values: Vec<f32>,
    seq_len: usize,
}

impl ContiguousLayer {
    fn new(p: &KvCacheParams) -> Self {
        Self { keys: vec![0.0; p.max_seq_len * width(p)], values: vec![0.0; p.max_seq_len * width(p)], seq_len: 0 }
    }
}

#[derive(Debug, Clone)]
struct SlidingWindowLayer {
    keys: Vec<f32>,
    values: Vec<f32>,
    total_tokens_seen: usize,
}

impl SlidingWindowLayer {
    fn new(p: &KvCacheParams, window: usize) -> Self {
        Self { keys: vec![0.0; window * width(p)], values: vec![0.0; window * width(p)], total_tokens_seen: 0 }
    }
}

#[derive(Debug, Clone)]
struct PagedLayer {
    key_pages: Vec<Vec<f32>>,
    value_pages: Vec<Vec<f32>>,
    page_table: Vec<usize>,
    seq_len: usize,
}

impl PagedLayer {
    fn new() -> Self { Self { key_pages: Vec::new(), value_pages: Vec::new(), page_table: Vec::new(), seq_len: 0 } }
}

#[derive(Debug, Clone)]
struct BdpaLayer {
    basis: Vec<(u32, Vec<f32>, Vec<f32>)>,
    residual_pages: Vec<Vec<i8>>,
    flat_index: Vec<(usize, usize, usize)>,
    seq_len: usize,
}

impl BdpaLayer {
    fn new() -> Self { Self { basis: Vec::new(), residual_pages: Vec::new(), flat_index: Vec::new(), seq_len: 0 } }
}

#[derive(Debug, Clone)]
enum Layers {
    Contiguous(Vec<ContiguousLayer>),
    SlidingWindow(Vec<SlidingWindowLayer>),
    Paged(Vec<PagedLayer>),
    Bdpa(Vec<BdpaLayer>),
}

/// Sealed variant over the four KV layouts. Construct via one of the
/// `new_*` constructors, chosen at `load_model` time; the active variant
/// never changes for the lifetime of one cache.
#[derive(Debug, Clone)]
pub struct KvCache {
    params: KvCacheParams,
    layers: Layers,
}

impl KvCache {
    pub fn new_contiguous(params: KvCacheParams) -> Self {
        let layers = (0..params.num_layers).map(|_| ContiguousLayer::new(&params)).collect();
        Self { layers: Layers::Contiguous(layers), params }
    }

    pub fn new_sliding_window(params: KvCacheParams) -> Result<Self> {
        let window = params
            .window_size
            .ok_or_else(|| RunnerError::InvalidConfig("sliding-window cache requires window_size".into()))?;
        let layers = (0..params.num_layers).map(|_| SlidingWindowLayer::new(&params, window)).collect();
        Ok(Self { layers: Layers::SlidingWindow(layers), params })
    }

    pub fn new_paged(params: KvCacheParams) -> Result<Self> {
        if params.page_size.is_none() {
            return Err(RunnerError::InvalidConfig("paged cache requires page_size".into()));
        }
        let layers = (0..params.num_layers).map(|_| PagedLayer::new()).collect();
        Ok(Self { layers: Layers::Paged(layers), params })
    }

    pub fn new_bdpa(params: KvCacheParams) -> Result<Self> {
        if params.basis_vocab_size.is_none() {
            return Err(RunnerError::InvalidConfig("bdpa cache requires basis_vocab_size".into()));
        }
        let layers = (0..params.num_layers).map(|_| BdpaLayer::new()).collect();
        Ok(Self { layers: Layers::Bdpa(layers), params })
    }

    pub fn params(&self) -> &KvCacheParams { &self.params }

    /// Integrates `num_tokens` new K/V rows for `layer` at `start_pos`.
    pub fn update(&mut self, layer: usize, keys: &[f32], values: &[f32], start_pos: usize, num_tokens: usize) -> Result<()> {
        self.update_from_gpu(layer, keys, values, start_pos, num_tokens, None)
    }

    pub fn update_from_gpu(
        &mut self,
        layer: usize,
        keys: &[f32],
        values: &[f32],
        start_pos: usize,
        num_tokens: usize,
        token_ids: Option<&[u32]>,
    ) -> Result<()> {
        let w = width(&self.params);
        match &mut self.layers {
            Layers::Contiguous(layers) => {
                let max = self.params.max_seq_len;
                if start_pos + num_tokens > max {
                    return Err(RunnerError::CacheOverflow(format!(
                        "contiguous kv cache: start_pos {start_pos} + num_tokens {num_tokens} exceeds max_seq_len {max}"
                    )));
                }
                let l = &mut layers[layer];
                l.keys[start_pos * w..(start_pos + num_tokens) * w].copy_from_slice(&keys[..num_tokens * w]);
                l.values[start_pos * w..(start_pos + num_tokens) * w].copy_from_slice(&values[..num_tokens * w]);
                l.seq_len = l.seq_len.max(start_pos + num_tokens);
            }
            Layers::SlidingWindow(layers) => {
                let window = self.params.window_size.unwrap();
                let l = &mut layers[layer];
                for i in 0..num_tokens {
                    let abs_pos = start_pos + i;
                    let slot = abs_pos % window;
                    l.keys[slot * w..(slot + 1) * w].copy_from_slice(&keys[i * w..(i + 1) * w]);
                    l.values[slot * w..(slot + 1) * w].copy_from_slice(&values[i * w..(i + 1) * w]);
                }
                l.total_tokens_seen = l.total_tokens_seen.max(start_pos + num_tokens);
            }
            Layers::Paged(layers) => {
                let page_size = self.params.page_size.unwrap();
                let l = &mut layers[layer];
                for i in 0..num_tokens {
                    let abs_pos = start_pos + i;
                    let page_idx = abs_pos / page_size;
                    let slot_in_page = abs_pos % page_size;
                    while l.key_pages.len() <= page_idx {
                        l.key_pages.push(vec![0.0; page_size * w]);
                        l.value_pages.push(vec![0.0; page_size * w]);
                    }
                    while l.page_table.len() <= abs_pos { l.page_table.push(0); }
                    l.page_table[abs_pos] = page_idx;
                    l.key_pages[page_idx][slot_in_page * w..(slot_in_page + 1) * w].copy_from_slice(&keys[i * w..(i + 1) * w]);
                    l.value_pages[page_idx][slot_in_page * w..(slot_in_page + 1) * w].copy_from_slice(&values[i * w..(i + 1) * w]);
                }
                l.seq_len = l.seq_len.max(start_pos + num_tokens);
            }
            Layers::Bdpa(layers) => {
                let Some(token_ids) = token_ids else {
                    return Err(RunnerError::InvalidConfig("bdpa update requires token_ids".into()));
                };
                let basis_vocab_size = self.params.basis_vocab_size.unwrap();
                let page_size = self.params.page_size.unwrap_or(16);
                let l = &mut layers[layer];
                rebuild_bdpa(l, token_ids, keys, values, start_pos, num_tokens, w, basis_vocab_size, page_size)?;
            }
        }
        Ok(())
    }

    /// Records a copy into an external recorder; never submits. BDPA refuses
    /// recorder-based ingestion unconditionally (design note §9): callers
    /// must disable command batching for BDPA runs.
    pub fn record_update_from_gpu(
        &mut self,
        recorder: &mut dyn crate::recorder::Recorder,
        layer: usize,
        keys: &[f32],
        values: &[f32],
        start_pos: usize,
        num_tokens: usize,
        token_ids: Option<&[u32]>,
    ) -> Result<()> {
        if matches!(self.layers, Layers::Bdpa(_)) {
            return Err(RunnerError::InvalidConfig(
                "bdpa kv cache refuses recorder-based ingestion; disable command batching".into(),
            ));
        }
        recorder.record(runner_backend::device::RecordedOp::KvAppend { layer, start_pos });
        self.update_from_gpu(layer, keys, values, start_pos, num_tokens, token_ids)
    }

    pub fn gpu_view(&self, layer: usize) -> KvView {
        match &self.layers {
            Layers::Contiguous(layers) => {
                let l = &layers[layer];
                KvView::Contiguous { keys: l.keys.clone(), values: l.values.clone(), seq_len: l.seq_len }
            }
            Layers::SlidingWindow(layers) => {
                let l = &layers[layer];
                KvView::Contiguous { keys: l.keys.clone(), values: l.values.clone(), seq_len: l.total_tokens_seen }
            }
            Layers::Paged(layers) => {
                let l = &layers[layer];
                let pages = l.key_pages.iter().cloned().zip(l.value_pages.iter().cloned()).collect();
                KvView::Paged { pages, page_table: l.page_table.clone(), seq_len: l.seq_len, page_size: self.params.page_size.unwrap() }
            }
            Layers::Bdpa(layers) => {
                let l = &layers[layer];
                KvView::Bdpa {
                    basis: l.basis.clone(),
                    residual_pages: l.residual_pages.clone(),
                    flat_index: l.flat_index.clone(),
                    num_basis_vectors: l.basis.len(),
                    page_size: self.params.page_size.unwrap_or(16),
                    seq_len: l.seq_len,
                }
            }
        }
    }

    /// RoPE position always uses the absolute token index, regardless of any
    /// modular storage offset (design note §9).
    pub fn rope_position(&self, absolute_index: usize) -> usize { absolute_index }

    pub fn current_seq_len(&self) -> usize {
        match &self.layers {
            Layers::Contiguous(layers) => layers.last().map(|l| l.seq_len).unwrap_or(0),
            Layers::SlidingWindow(layers) => layers.last().map(|l| l.total_tokens_seen).unwrap_or(0),
            Layers::Paged(layers) => layers.last().map(|l| l.seq_len).unwrap_or(0),
            Layers::Bdpa(layers) => layers.last().map(|l| l.seq_len).unwrap_or(0),
        }
    }

    /// Rewinds `current_seq_len` without reclaiming storage. Idempotent for
    /// `length >= current`.
    pub fn truncate(&mut self, length: usize) {
        match &mut self.layers {
            Layers::Contiguous(layers) => for l in layers.iter_mut() { l.seq_len = l.seq_len.min(length); },
            Layers::SlidingWindow(layers) => for l in layers.iter_mut() { l.total_tokens_seen = l.total_tokens_seen.min(length); },
            Layers::Paged(layers) => for l in layers.iter_mut() { l.seq_len = l.seq_len.min(length); },
            Layers::Bdpa(layers) => for l in layers.iter_mut() { l.seq_len = l.seq_len.min(length); },
        }
    }

    pub fn clear(&mut self) {
        match &mut self.layers {
            Layers::Contiguous(layers) => for l in layers.iter_mut() {
                l.keys.iter_mut().for_each(|v| *v = 0.0);
                l.values.iter_mut().for_each(|v| *v = 0.0);
                l.seq_len = 0;
            },
            Layers::SlidingWindow(layers) => for l in layers.iter_mut() {
                l.keys.iter_mut().for_each(|v| *v = 0.0);
                l.values.iter_mut().for_each(|v| *v = 0.0);
                l.total_tokens_seen = 0;
            },
            Layers::Paged(layers) => for l in layers.iter_mut() { *l = PagedLayer::new(); },
            Layers::Bdpa(layers) => for l in layers.iter_mut() { *l = BdpaLayer::new(); },
        }
    }

    pub fn destroy(self) {}

    /// Deep copy for speculative rollback / prefix reuse. The clone is
    /// independent of the original cache from this point on.
    pub fn clone_cache(&self) -> Self { self.clone() }
}

#[allow(clippy::too_many_arguments)]
fn rebuild_bdpa(
    layer: &mut BdpaLayer,
    token_ids: &[u32],
    keys: &[f32],
    values: &[f32],
    start_pos: usize,
    num_tokens: usize,
    width: usize,
    basis_vocab_size: usize,
    page_size: usize,
) -> Result<()> {
    // Radix-sort (counting-sort, ids are small unsigned ints) the incoming
    // token ids to group contiguous runs per unique id before averaging.
    let mut order: Vec<usize> = (0..num_tokens).collect();
    order.sort_by_key(|&i| token_ids[i]);

    let mut basis_by_id: std::collections::BTreeMap<u32, (Vec<f32>, Vec<f32>, usize)> = std::collections::BTreeMap::new();
    for &i in &order {
        let id = token_ids[i];
        let k = &keys[i * width..(i + 1) * width];
        let v = &values[i * width..(i + 1) * width];
        let entry = basis_by_id.entry(id).or_insert_with(|| (vec![0.0; width], vec![0.0; width], 0));
        for j in 0..width {
            entry.0[j] += k[j];
            entry.1[j] += v[j];
        }
        entry.2 += 1;
    }
    if basis_by_id.len() > basis_vocab_size {
        return Err(RunnerError::BasisOverflow(format!(
            "bdpa cache: {} unique token ids exceeds basis_vocab_size {basis_vocab_size}",
            basis_by_id.len()
        )));
    }

    layer.basis.clear();
    let mut basis_index: std::collections::HashMap<u32, usize> = std::collections::HashMap::new();
    for (id, (ksum, vsum, count)) in &basis_by_id {
        let mean_k: Vec<f32> = ksum.iter().map(|s| s / *count as f32).collect();
        let mean_v: Vec<f32> = vsum.iter().map(|s| s / *count as f32).collect();
        basis_index.insert(*id, layer.basis.len());
        layer.basis.push((*id, mean_k, mean_v));
    }

    layer.residual_pages.clear();
    layer.flat_index.clear();
    for (slot, &i) in order.iter().enumerate() {
        let id = token_ids[i];
        let basis_ptr = basis_index[&id];
        let (_, mean_k, _mean_v) = &layer.basis[basis_ptr];
        let k = &keys[i * width..(i + 1) * width];
        let residual: Vec<i8> = k
            .iter()
            .zip(mean_k.iter())
            .map(|(a, b)| ((a - b).clamp(-1.0, 1.0) * 127.0) as i8)
            .collect();
        let page_idx = slot / page_size;
        while layer.residual_pages.len() <= page_idx { layer.residual_pages.push(Vec::new()); }
        layer.residual_pages[page_idx].extend_from_slice(&residual);
        let original_pos = start_pos + i;
        layer.flat_index.push((basis_ptr, page_idx, original_pos));
    }
    layer.seq_len = layer.seq_len.max(start_pos + num_tokens);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> KvCacheParams {
        KvCacheParams { num_layers: 2, num_kv_heads: 2, head_dim: 4, max_seq_len: 8, kv_dtype: KvDtype::F32, window_size: None, page_size: None, basis_vocab_size: None }
    }

    #[test]
    fn contiguous_overflow_errors() {
        let mut cache = KvCache::new_contiguous(params());
        let kv = vec![1.0; 8 * 10];
        let err = cache.update(0, &kv, &kv, 7, 10).unwrap_err();
        assert!(matches!(err, RunnerError::CacheOverflow(_)));
    }

    #[test]
    fn contiguous_stores_at_exact_positions() {
        let mut cache = KvCache::new_contiguous(params());
        let w = 8;
        let kv: Vec<f32> = (0..3 * w).map(|i| i as f32).collect();
        cache.update_from_gpu(0, &kv, &kv, 2, 3, None).unwrap();
        match cache.gpu_view(0) {
            KvView::Contiguous { keys, seq_len, .. } => {
                assert_eq!(seq_len, 5);
                assert_eq!(&keys[2 * w..5 * w], &kv[..]);
            }
            _ => panic!("expected contiguous view"),
        }
    }

    #[test]
    fn sliding_window_wraps_and_tracks_absolute_position() {
        let mut p = params();
        p.window_size = Some(4);
        let mut cache = KvCache::new_sliding_window(p).unwrap();
        let w = 8;
        let kv3: Vec<f32> = (0..3 * w).map(|i| i as f32).collect();
        cache.update_from_gpu(0, &kv3, &kv3, 0, 3, None).unwrap();
        for p_abs in 3..6 {
            let kv1: Vec<f32> = vec![p_abs as f32; w];
            cache.update_from_gpu(0, &kv1, &kv1, p_abs, 1, None).unwrap();
        }
        assert_eq!(cache.current_seq_len(), 6);
        match cache.gpu_view(0) {
            KvView::Contiguous { keys, .. } => {
                // absolute position 5 wraps to slot 5 % 4 == 1
                assert_eq!(keys[w], 5.0);
            }
            _ => panic!("expected sliding-window view (contiguous storage)"),
        }
        assert_eq!(cache.rope_position(5), 5);
    }

    #[test]
    fn paged_layout_maps_logical_position_to_page() {
        let mut p = params();
        p.page_size = Some(2);
        let mut cache = KvCache::new_paged(p).unwrap();
        let w = 8;
        let kv: Vec<f32> = (0..5 * w).map(|i| i as f32).collect();
        cache.update_from_gpu(0, &kv, &kv, 0, 5, None).unwrap();
        match cache.gpu_view(0) {
            KvView::Paged { pages, page_table, seq_len, page_size } => {
                assert_eq!(seq_len, 5);
                assert_eq!(page_size, 2);
                assert_eq!(pages.len(), 3);
                assert_eq!(page_table[4], 2);
            }
            _ => panic!("expected paged view"),
        }
    }

    #[test]
    fn bdpa_rebuilds_basis_and_refuses_recorder_ingestion() {
        let mut p = params();
        p.basis_vocab_size = Some(4);
        p.page_size = Some(4);
        let mut cache = KvCache::new_bdpa(p).unwrap();
        let w = 8;
        let ids = [1u32, 2, 1, 3];
        let kv: Vec<f32> = (0..4 * w).map(|i| i as f32).collect();
        cache.update_from_gpu(0, &kv, &kv, 0, 4, Some(&ids)).unwrap();
        match cache.gpu_view(0) {
            KvView::Bdpa { num_basis_vectors, flat_index, .. } => {
                assert_eq!(num_basis_vectors, 3);
                assert_eq!(flat_index.len(), 4);
            }
            _ => panic!("expected bdpa view"),
        }
    }

    #[test]
    fn bdpa_overflows_when_unique_ids_exceed_vocab() {
        let mut p = params();
        p.basis_vocab_size = Some(1);
        p.page_size = Some(4);
        let mut cache = KvCache::new_bdpa(p).unwrap();
        let w = 8;
        let ids = [1u32, 2];
        let kv: Vec<f32> = (0..2 * w).map(|i| i as f32).collect();
        let err = cache.update_from_gpu(0, &kv, &kv, 0, 2, Some(&ids)).unwrap_err();
        assert!(matches!(err, RunnerError::BasisOverflow(_)));
    }

    #[test]
    fn truncate_is_idempotent_past_current_length() {
        let mut cache = KvCache::new_contiguous(params());
        let w = 8;
        let kv: Vec<f32> = vec![1.0; 2 * w];
        cache.update_from_gpu(0, &kv, &kv, 0, 2, None).unwrap();
        cache.truncate(10);
        assert_eq!(cache.gpu_view(0).seq_len(), 2);
    }

    #[test]
    fn clone_cache_is_independent() {
        let mut cache = KvCache::new_contiguous(params());
        let w = 8;
        let kv: Vec<f32> = vec![1.0; 2 * w];
        cache.update_from_gpu(0, &kv, &kv, 0, 2, None).unwrap();
        let clone = cache.clone_cache();
        cache.update_from_gpu(0, &kv, &kv, 2, 1, None).unwrap();
        assert_eq!(clone.current_seq_len(), 2);
        assert_eq!(cache.current_seq_len(), 3);
    }
}
