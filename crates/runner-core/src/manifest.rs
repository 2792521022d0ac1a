//! Model manifest parsing and the immutable model configuration it resolves to.

use runner_common::{Result, RunnerError};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RopeScalingType {
    None,
    Linear,
    Yarn,
}

impl Default for RopeScalingType {
    fn default() -> Self { RopeScalingType::None }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenizerSpec {
    pub kind: String,
    #[serde(default)]
    pub vocab_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OptimizationsSpec {
    #[serde(default)]
    pub kernel_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InferencePresetSpec {
    #[serde(default)]
    pub preset_id: Option<String>,
}

/// The manifest as consumed from the shard loader / model registry. Shard
/// bytes, hashing, and quantization payloads are external collaborators —
/// only the structural fields the core reads are modeled here.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub model_id: String,
    pub architecture: String,
    pub num_layers: usize,
    pub hidden_size: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    pub rope_theta: f32,
    #[serde(default)]
    pub rope_scale: f32,
    #[serde(default)]
    pub rope_scaling_type: RopeScalingType,
    #[serde(default)]
    pub rope_local_theta: Option<f32>,
    pub rms_norm_eps: f32,
    #[serde(default)]
    pub stop_token_ids: Vec<u32>,
    pub tokenizer: TokenizerSpec,
    #[serde(default)]
    pub quantization: Option<String>,
    #[serde(default)]
    pub shards: Vec<String>,
    #[serde(default)]
    pub optimizations: OptimizationsSpec,
    #[serde(default)]
    pub inference: InferencePresetSpec,
    #[serde(default)]
    pub scale_embeddings: bool,
    #[serde(default)]
    pub final_logit_softcapping: Option<f32>,
    #[serde(default)]
    pub use_tied_embeddings: bool,
    #[serde(default)]
    pub use_moe: bool,
}

/// Immutable once `load_model` has parsed and validated it.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub num_layers: usize,
    pub hidden_size: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    pub rope_theta: f32,
    pub rope_local_theta: Option<f32>,
    pub rope_scale: f32,
    pub rope_scaling_type: RopeScalingType,
    pub rms_norm_eps: f32,
    pub scale_embeddings: bool,
    pub final_logit_softcapping: Option<f32>,
    pub stop_token_ids: Vec<u32>,
    pub use_moe: bool,
    pub use_tied_embeddings: bool,
    pub kernel_path: Option<String>,
}

impl ModelConfig {
    pub fn from_manifest(m: &Manifest) -> Result<Self> {
        if m.num_kv_heads == 0 || m.num_heads % m.num_kv_heads != 0 {
            return Err(RunnerError::ManifestInvalid(format!(
                "num_heads ({}) must be a multiple of num_kv_heads ({})",
                m.num_heads, m.num_kv_heads
            )));
        }
        if m.hidden_size != m.num_heads * m.head_dim {
            return Err(RunnerError::ManifestInvalid(format!(
                "hidden_size ({}) must equal num_heads * head_dim ({} * {})",
                m.hidden_size, m.num_heads, m.head_dim
            )));
        }
        if m.num_layers == 0 || m.vocab_size == 0 || m.max_seq_len == 0 {
            return Err(RunnerError::ManifestInvalid(
                "num_layers, vocab_size, and max_seq_len must all be positive".into(),
            ));
        }
        Ok(Self {
            num_layers: m.num_layers,
            hidden_size: m.hidden_size,
            num_heads: m.num_heads,
            num_kv_heads: m.num_kv_heads,
            head_dim: m.head_dim,
            intermediate_size: m.intermediate_size,
            vocab_size: m.vocab_size,
            max_seq_len: m.max_seq_len,
            rope_theta: m.rope_theta,
            rope_local_theta: m.rope_local_theta,
            rope_scale: if m.rope_scale == 0.0 { 1.0 } else { m.rope_scale },
            rope_scaling_type: m.rope_scaling_type,
            rms_norm_eps: m.rms_norm_eps,
            scale_embeddings: m.scale_embeddings,
            final_logit_softcapping: m.final_logit_softcapping,
            stop_token_ids: m.stop_token_ids.clone(),
            use_moe: m.use_moe,
            use_tied_embeddings: m.use_tied_embeddings,
            kernel_path: m.optimizations.kernel_path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        Manifest {
            model_id: "demo".into(),
            architecture: "demo-arch".into(),
            num_layers: 2,
            hidden_size: 16,
            num_heads: 4,
            num_kv_heads: 2,
            head_dim: 4,
            intermediate_size: 32,
            vocab_size: 32000,
            max_seq_len: 2048,
            rope_theta: 10000.0,
            rope_scale: 1.0,
            rope_scaling_type: RopeScalingType::None,
            rope_local_theta: None,
            rms_norm_eps: 1e-5,
            stop_token_ids: vec![2],
            tokenizer: TokenizerSpec { kind: "bpe".into(), vocab_size: Some(32000) },
            quantization: None,
            shards: vec![],
            optimizations: OptimizationsSpec::default(),
            inference: InferencePresetSpec::default(),
            scale_embeddings: false,
            final_logit_softcapping: None,
            use_tied_embeddings: false,
            use_moe: false,
        }
    }

    #[test]
    fn rejects_mismatched_heads() {
        let mut m = sample_manifest();
        m.num_kv_heads = 3;
        assert!(ModelConfig::from_manifest(&m).is_err());
    }

    #[test]
    fn rejects_mismatched_hidden_size() {
        let mut m = sample_manifest();
        m.hidden_size = 17;
        assert!(ModelConfig::from_manifest(&m).is_err());
    }

    #[test]
    fn accepts_valid_manifest() {
        let m = sample_manifest();
        let cfg = ModelConfig::from_manifest(&m).unwrap();
        assert_eq!(cfg.num_layers, 2);
    }
}
