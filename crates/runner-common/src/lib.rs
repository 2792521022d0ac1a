pub type Result<T> = core::result::Result<T, RunnerError>;

/// Error kinds shared by every crate in the workspace.
///
/// Variants that name a resource carry the offending config key or resource
/// name so a caller can act on the failure without parsing the message.
#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    #[error("pipeline not loaded")]
    NotLoaded,
    #[error("a generation is already in progress")]
    AlreadyGenerating,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid model manifest: {0}")]
    ManifestInvalid(String),
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("kv cache overflow: {0}")]
    CacheOverflow(String),
    #[error("bdpa basis overflow: {0}")]
    BasisOverflow(String),
    #[error("readback denied: {0}")]
    ReadbackDenied(String),
    #[error("kernel unavailable: {0}")]
    KernelUnavailable(String),
    #[error("batch path fell back to single-token decode: {0}")]
    BatchFallback(String),
    #[error("generation cancelled")]
    Cancelled,
    #[error("not implemented")]
    NotImplemented,
    #[error("{0}")]
    Message(String),
}

pub mod config {
    use serde::Deserialize;
    use std::env;
    use std::path::PathBuf;

    #[derive(Debug, Clone, Deserialize)]
    #[serde(default)]
    pub struct SamplingConfig {
        pub temperature: f32,
        pub top_p: f32,
        pub top_k: usize,
        pub repetition_penalty: f32,
        pub greedy_threshold: f32,
    }

    impl Default for SamplingConfig {
        fn default() -> Self {
            Self { temperature: 0.7, top_p: 1.0, top_k: 0, repetition_penalty: 1.0, greedy_threshold: 1e-5 }
        }
    }

    #[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "snake_case")]
    pub enum StopCheckMode {
        Batch,
        PerToken,
    }

    impl Default for StopCheckMode {
        fn default() -> Self { StopCheckMode::Batch }
    }

    #[derive(Debug, Clone, Deserialize)]
    #[serde(default)]
    pub struct BatchingConfig {
        pub max_tokens: usize,
        pub batch_size: usize,
        pub stop_check_mode: StopCheckMode,
    }

    impl Default for BatchingConfig {
        fn default() -> Self {
            Self { max_tokens: 128, batch_size: 1, stop_check_mode: StopCheckMode::Batch }
        }
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(default)]
    pub struct GenerationConfig {
        pub profile: bool,
        pub disable_command_batching: bool,
        pub disable_multi_token_decode: bool,
    }

    #[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum KvLayoutKind {
        Contiguous,
        SlidingWindow,
        Paged,
        Bdpa,
    }

    impl Default for KvLayoutKind {
        fn default() -> Self { KvLayoutKind::Contiguous }
    }

    #[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum KvDtype {
        F16,
        F32,
    }

    impl Default for KvDtype {
        fn default() -> Self { KvDtype::F16 }
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(default)]
    pub struct KvCacheConfig {
        pub layout: KvLayoutKind,
        pub kv_dtype: KvDtype,
        pub window_size: Option<usize>,
        pub page_size: Option<usize>,
        pub bdpa_vocab_size: Option<usize>,
    }

    #[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum ActivationDtype {
        F16,
        F32,
    }

    impl Default for ActivationDtype {
        fn default() -> Self { ActivationDtype::F32 }
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(default)]
    pub struct ComputeConfig {
        pub activation_dtype: ActivationDtype,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(default)]
    pub struct InferenceSection {
        pub sampling: SamplingConfig,
        pub batching: BatchingConfig,
        pub generation: GenerationConfig,
        pub kvcache: KvCacheConfig,
        pub compute: ComputeConfig,
        pub prompt: Option<String>,
        pub chat_template_enabled: bool,
        pub kernel_path: Option<String>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(default)]
    pub struct DebugConfig {
        pub probes: Vec<String>,
        pub profiler_enabled: bool,
        pub readback_sample_size: Option<usize>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(default)]
    pub struct BenchmarkRunConfig {
        pub warmup_runs: usize,
        pub timed_runs: usize,
        pub max_new_tokens: usize,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct RunnerConfig {
        pub model_dir: PathBuf,
        pub context_size: Option<usize>,
        pub gpu_layers: Option<usize>,
        pub max_batch_tokens: Option<usize>,
        #[serde(default)]
        pub inference: InferenceSection,
        #[serde(default)]
        pub debug: DebugConfig,
        #[serde(default)]
        pub benchmark: BenchmarkRunConfig,
    }

    impl Default for RunnerConfig {
        fn default() -> Self {
            Self {
                model_dir: PathBuf::from("models"),
                context_size: Some(2048),
                gpu_layers: None,
                max_batch_tokens: Some(1024),
                inference: InferenceSection::default(),
                debug: DebugConfig::default(),
                benchmark: BenchmarkRunConfig::default(),
            }
        }
    }

    impl RunnerConfig {
        pub fn load() -> Self {
            if let Ok(path) = env::var("RUNNER_CONFIG") {
                let Ok(text) = std::fs::read_to_string(path) else { return Self::default() };
                let Ok(cfg) = serde_yaml::from_str::<RunnerConfig>(&text) else { return Self::default() };
                return cfg;
            }
            let mut cfg = Self::default();
            if let Ok(dir) = env::var("RUNNER_MODEL_DIR") {
                cfg.model_dir = PathBuf::from(dir);
            }
            if let Some(v) = env::var("RUNNER_CONTEXT_SIZE").ok().and_then(|v| v.parse().ok()) { cfg.context_size = Some(v); }
            if let Some(v) = env::var("RUNNER_GPU_LAYERS").ok().and_then(|v| v.parse().ok()) { cfg.gpu_layers = Some(v); }
            if let Some(v) = env::var("RUNNER_MAX_BATCH_TOKENS").ok().and_then(|v| v.parse().ok()) { cfg.max_batch_tokens = Some(v); }
            if let Some(v) = env::var("RUNNER_BATCH_SIZE").ok().and_then(|v| v.parse().ok()) { cfg.inference.batching.batch_size = v; }
            if let Some(v) = env::var("RUNNER_TEMPERATURE").ok().and_then(|v| v.parse().ok()) { cfg.inference.sampling.temperature = v; }
            cfg
        }
    }
}
