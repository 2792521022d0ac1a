//! RoPE frequency tables, cached per `(head_dim, theta, scale, scaling)` key
//! so repeated `load_model` calls with an unchanged configuration reuse the
//! same table instead of recomputing it.

use std::collections::HashMap;

use crate::manifest::RopeScalingType;

#[derive(Debug, Clone, Copy, PartialEq)]
struct FreqKey {
    head_dim: usize,
    theta_bits: u32,
    scale_bits: u32,
    scaling: RopeScalingTag,
    local_theta_bits: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RopeScalingTag {
    None,
    Linear,
    Yarn,
}

impl From<RopeScalingType> for RopeScalingTag {
    fn from(t: RopeScalingType) -> Self {
        match t {
            RopeScalingType::None => RopeScalingTag::None,
            RopeScalingType::Linear => RopeScalingTag::Linear,
            RopeScalingType::Yarn => RopeScalingTag::Yarn,
        }
    }
}

impl FreqKey {
    fn new(head_dim: usize, theta: f32, scale: f32, scaling: RopeScalingType, local_theta: Option<f32>) -> Self {
        Self {
            head_dim,
            theta_bits: theta.to_bits(),
            scale_bits: scale.to_bits(),
            scaling: scaling.into(),
            local_theta_bits: local_theta.map(|t| t.to_bits()),
        }
    }
}

/// Precomputed `cos`/`sin` tables indexed by absolute position.
pub struct RopeTable {
    head_dim: usize,
    inv_freq: Vec<f32>,
}

impl RopeTable {
    fn build(head_dim: usize, theta: f32, scale: f32, scaling: RopeScalingType) -> Self {
        let half = head_dim / 2;
        let mut inv_freq = Vec::with_capacity(half);
        for i in 0..half {
            let exponent = (2 * i) as f32 / head_dim as f32;
            let mut freq = 1.0 / theta.powf(exponent);
            match scaling {
                RopeScalingType::None => {}
                RopeScalingType::Linear => freq /= scale,
                RopeScalingType::Yarn => freq /= scale.sqrt(),
            }
            inv_freq.push(freq);
        }
        Self { head_dim, inv_freq }
    }

    /// Returns `(cos, sin)` pairs for every frequency at `absolute_position`.
    pub fn at(&self, absolute_position: usize) -> Vec<(f32, f32)> {
        let pos = absolute_position as f32;
        self.inv_freq.iter().map(|&f| { let angle = pos * f; (angle.cos(), angle.sin()) }).collect()
    }

    pub fn head_dim(&self) -> usize { self.head_dim }
}

#[derive(Default)]
pub struct RopeCache {
    tables: HashMap<FreqKey, std::sync::Arc<RopeTable>>,
}

impl RopeCache {
    pub fn new() -> Self { Self::default() }

    pub fn get_or_build(
        &mut self,
        head_dim: usize,
        theta: f32,
        scale: f32,
        scaling: RopeScalingType,
        local_theta: Option<f32>,
    ) -> std::sync::Arc<RopeTable> {
        let key = FreqKey::new(head_dim, theta, scale, scaling, local_theta);
        self.tables
            .entry(key)
            .or_insert_with(|| std::sync::Arc::new(RopeTable::build(head_dim, local_theta.unwrap_or(theta), scale, scaling)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_reused_for_identical_parameters() {
        let mut cache = RopeCache::new();
        let a = cache.get_or_build(64, 10000.0, 1.0, RopeScalingType::None, None);
        let b = cache.get_or_build(64, 10000.0, 1.0, RopeScalingType::None, None);
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_theta_builds_a_new_table() {
        let mut cache = RopeCache::new();
        let a = cache.get_or_build(64, 10000.0, 1.0, RopeScalingType::None, None);
        let b = cache.get_or_build(64, 1000000.0, 1.0, RopeScalingType::None, None);
        assert!(!std::sync::Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn position_zero_is_identity_rotation() {
        let mut cache = RopeCache::new();
        let table = cache.get_or_build(8, 10000.0, 1.0, RopeScalingType::None, None);
        for (cos, sin) in table.at(0) {
            assert!((cos - 1.0).abs() < 1e-6);
            assert!(sin.abs() < 1e-6);
        }
    }

    #[test]
    fn linear_scaling_slows_rotation_rate() {
        let mut cache = RopeCache::new();
        let unscaled = cache.get_or_build(8, 10000.0, 1.0, RopeScalingType::None, None);
        let scaled = cache.get_or_build(8, 10000.0, 4.0, RopeScalingType::Linear, None);
        let (_, sin_u) = unscaled.at(8)[0];
        let (_, sin_s) = scaled.at(8)[0];
        assert!(sin_s.abs() < sin_u.abs());
    }
}
