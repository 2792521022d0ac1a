//! The weight map: a tagged variant per entry, dispatched on at the
//! embed/logits layer instead of runtime type-probing (design note, §9).

use std::collections::HashMap;

use runner_backend::device::{BufferHandle, Dtype};

#[derive(Debug, Clone)]
pub enum WeightValue {
    Gpu(BufferHandle, Dtype),
    Cpu(Vec<f32>, Dtype),
    TypedGpu(BufferHandle, Dtype),
    Absent,
}

/// Owns every weight entry exclusively; `unload` drops the map, destroying
/// every GPU-resident buffer it referenced (the pool is told to free them
/// before the map itself is dropped).
#[derive(Debug, Default)]
pub struct WeightMap {
    entries: HashMap<String, WeightValue>,
}

impl WeightMap {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, name: impl Into<String>, value: WeightValue) {
        self.entries.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> &WeightValue {
        self.entries.get(name).unwrap_or(&WeightValue::Absent)
    }

    pub fn contains(&self, name: &str) -> bool {
        matches!(self.entries.get(name), Some(v) if !matches!(v, WeightValue::Absent))
    }

    /// Synthesizes a fused QKV entry lazily from separate Q/K/V weights, if
    /// one isn't already present. No-op if `qkv_name` already exists.
    pub fn fuse_qkv(&mut self, qkv_name: &str, q_name: &str, k_name: &str, v_name: &str) {
        if self.contains(qkv_name) { return; }
        match (self.entries.get(q_name), self.entries.get(k_name), self.entries.get(v_name)) {
            (Some(WeightValue::Cpu(q, dt)), Some(WeightValue::Cpu(k, _)), Some(WeightValue::Cpu(v, _))) => {
                let mut fused = Vec::with_capacity(q.len() + k.len() + v.len());
                fused.extend_from_slice(q);
                fused.extend_from_slice(k);
                fused.extend_from_slice(v);
                let dt = *dt;
                self.insert(qkv_name, WeightValue::Cpu(fused, dt));
            }
            _ => {
                // GPU-resident or absent Q/K/V: the fused buffer is built by
                // the compute backend at layer-recording time instead.
            }
        }
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn clear(&mut self) { self.entries.clear(); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_is_the_default_lookup_result() {
        let map = WeightMap::new();
        assert!(matches!(map.get("missing"), WeightValue::Absent));
    }

    #[test]
    fn fuse_qkv_concatenates_cpu_weights() {
        let mut map = WeightMap::new();
        map.insert("layer.0.q", WeightValue::Cpu(vec![1.0, 2.0], Dtype::F32));
        map.insert("layer.0.k", WeightValue::Cpu(vec![3.0], Dtype::F32));
        map.insert("layer.0.v", WeightValue::Cpu(vec![4.0], Dtype::F32));
        map.fuse_qkv("layer.0.qkv", "layer.0.q", "layer.0.k", "layer.0.v");
        match map.get("layer.0.qkv") {
            WeightValue::Cpu(v, _) => assert_eq!(v, &vec![1.0, 2.0, 3.0, 4.0]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fuse_qkv_is_idempotent() {
        let mut map = WeightMap::new();
        map.insert("qkv", WeightValue::Cpu(vec![9.0], Dtype::F32));
        map.fuse_qkv("qkv", "q", "k", "v");
        match map.get("qkv") {
            WeightValue::Cpu(v, _) => assert_eq!(v, &vec![9.0]),
            other => panic!("unexpected {other:?}"),
        }
    }
}
