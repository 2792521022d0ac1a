//! Per-call generation options, distinct from the process-wide `RunnerConfig`
//! defaults it overrides.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use runner_common::config::StopCheckMode;

/// Checked at the top of every decode iteration; cooperative, not
/// preemptive — a cancelled generation still finishes its in-flight batch.
#[derive(Clone, Default)]
pub struct CancellationSignal(Arc<AtomicBool>);

impl CancellationSignal {
    pub fn new() -> Self { Self(Arc::new(AtomicBool::new(false))) }
    pub fn cancel(&self) { self.0.store(true, Ordering::SeqCst); }
    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::SeqCst) }
}

pub type TokenCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type BatchCallback = Arc<dyn Fn(&[String]) + Send + Sync>;

#[derive(Clone)]
pub struct GenerationOptions {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub repetition_penalty: f32,
    /// Below this, sampling is treated as greedy (argmax) regardless of the
    /// nominal temperature value. Mirrors `SamplingConfig::greedy_threshold`.
    pub greedy_threshold: f32,
    pub stop_sequences: Vec<String>,
    pub use_chat_template: bool,
    pub batch_size: usize,
    pub stop_check_mode: StopCheckMode,
    pub profile: bool,
    /// Collects per-call timing into the returned `GenerationStats` instead
    /// of discarding it after the `runner-obs` histogram observation.
    pub benchmark: bool,
    pub disable_batching: bool,
    /// Layer indices at which `run_layers_and_append_kv` flushes and restarts
    /// its recorder mid-prefill, so a debugger can read back intermediate
    /// hidden state between those layers instead of only the final output.
    pub debug_layers: Vec<usize>,
    pub seed: Option<u64>,
    pub cancellation: CancellationSignal,
    pub on_token: Option<TokenCallback>,
    pub on_batch: Option<BatchCallback>,
}

impl std::fmt::Debug for GenerationOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationOptions")
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("top_k", &self.top_k)
            .field("repetition_penalty", &self.repetition_penalty)
            .field("greedy_threshold", &self.greedy_threshold)
            .field("stop_sequences", &self.stop_sequences)
            .field("use_chat_template", &self.use_chat_template)
            .field("batch_size", &self.batch_size)
            .field("stop_check_mode", &self.stop_check_mode)
            .field("profile", &self.profile)
            .field("benchmark", &self.benchmark)
            .field("disable_batching", &self.disable_batching)
            .field("debug_layers", &self.debug_layers)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
            greedy_threshold: 1e-5,
            stop_sequences: Vec::new(),
            use_chat_template: false,
            batch_size: 1,
            stop_check_mode: StopCheckMode::Batch,
            profile: false,
            benchmark: false,
            disable_batching: false,
            debug_layers: Vec::new(),
            seed: None,
            cancellation: CancellationSignal::new(),
            on_token: None,
            on_batch: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_unbatched_greedy_friendly() {
        let opts = GenerationOptions::default();
        assert_eq!(opts.batch_size, 1);
        assert_eq!(opts.repetition_penalty, 1.0);
        assert!(!opts.cancellation.is_cancelled());
    }

    #[test]
    fn cancellation_signal_is_shared_across_clones() {
        let signal = CancellationSignal::new();
        let clone = signal.clone();
        clone.cancel();
        assert!(signal.is_cancelled());
    }
}
