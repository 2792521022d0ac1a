//! Thin iterator facade over [`Pipeline`]. [`generate`] owns the pipeline
//! mutably for the duration of one call and exposes a genuinely pull-based
//! `Stream<Item = Result<TextPiece>>`: each `poll_next` performs at most one
//! prefill/decode step, so a caller that stops polling (or drops the stream)
//! part-way through never triggers the remaining GPU work, and the
//! cancellation signal is rechecked before every step rather than only once
//! up front.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio_stream::Stream;
use tracing::instrument;

use runner_common::{Result, RunnerError};

use crate::chat_template::matches_stop_sequence;
use crate::options::GenerationOptions;
use crate::pipeline::{Pipeline, TextPiece};

/// Renders a token id to text. Tokenizer detokenization is an external
/// collaborator; callers supply it so this module stays tokenizer-agnostic.
pub trait Detokenizer: Send + Sync {
    fn detokenize_one(&self, token_id: u32) -> String;
}

pub struct EchoDetokenizer;
impl Detokenizer for EchoDetokenizer {
    fn detokenize_one(&self, token_id: u32) -> String { format!("<{token_id}>") }
}

/// Bridges the coarse whole-sequence `InferenceBackend::detokenize` to the
/// per-token interface this module streams against. A thin wrapper (rather
/// than a blanket impl) since `&dyn InferenceBackend` can't be reinterpreted
/// as `&dyn Detokenizer` through trait-object coercion alone.
pub struct BackendDetokenizer<'a>(pub &'a dyn runner_backend::InferenceBackend);

impl<'a> Detokenizer for BackendDetokenizer<'a> {
    fn detokenize_one(&self, token_id: u32) -> String {
        self.0.detokenize(&[token_id]).unwrap_or_default()
    }
}

enum Phase {
    NotStarted,
    Running,
    Done,
}

/// A lazily driven generation: prefill happens on the first poll, each
/// subsequent poll performs one `decode_step` or one `decode_batch`. Holds
/// the `generating` guard for its entire lifetime — from the first poll
/// until either the stream naturally finishes or is dropped early.
pub struct GenerationStream<'a> {
    pipeline: &'a mut Pipeline,
    detok: &'a dyn Detokenizer,
    prompt_tokens: Vec<u32>,
    opts: GenerationOptions,
    history: Vec<u32>,
    generated_text: String,
    count: usize,
    last_token: u32,
    queue: VecDeque<Result<TextPiece>>,
    phase: Phase,
    guard_held: bool,
}

impl<'a> GenerationStream<'a> {
    fn new(pipeline: &'a mut Pipeline, detok: &'a dyn Detokenizer, prompt_tokens: &[u32], opts: GenerationOptions) -> Self {
        Self {
            pipeline,
            detok,
            prompt_tokens: prompt_tokens.to_vec(),
            opts,
            history: Vec::new(),
            generated_text: String::new(),
            count: 0,
            last_token: 0,
            queue: VecDeque::new(),
            phase: Phase::NotStarted,
            guard_held: false,
        }
    }

    fn emit(&mut self, token: u32) {
        let text = self.detok.detokenize_one(token);
        self.generated_text.push_str(&text);
        if let Some(cb) = &self.opts.on_token { cb(&text); }
        self.queue.push_back(Ok(TextPiece { id: token, text }));
    }

    fn should_stop_on_text(&self) -> bool {
        matches_stop_sequence(&self.generated_text, &self.opts.stop_sequences).is_some()
    }

    /// Runs the prefill leg. Called once, from the first poll.
    fn start(&mut self) -> std::result::Result<(), RunnerError> {
        self.history = self.prompt_tokens.clone();
        if self.opts.max_tokens == 0 {
            return Ok(());
        }
        let outcome = self.pipeline.prefill_body(&self.prompt_tokens, &self.opts)?;
        self.emit(outcome.first_token);
        self.history.push(outcome.first_token);
        self.last_token = outcome.first_token;
        self.count = 1;
        Ok(())
    }

    /// Runs one decode step (or one decode batch) and enqueues its pieces.
    /// Returns `true` if generation should stop after this step.
    fn step(&mut self) -> std::result::Result<bool, RunnerError> {
        if self.opts.batch_size > 1 {
            let remaining = self.opts.batch_size.min(self.opts.max_tokens - self.count);
            let mut batch_opts = self.opts.clone();
            batch_opts.batch_size = remaining;
            let batch = self.pipeline.decode_batch(self.last_token, self.history.clone(), &batch_opts)?;
            let mut batch_texts = Vec::with_capacity(batch.tokens.len());
            for &tok in &batch.tokens {
                let text = self.detok.detokenize_one(tok);
                batch_texts.push(text.clone());
                self.generated_text.push_str(&text);
                self.history.push(tok);
                if let Some(cb) = &self.opts.on_token { cb(&text); }
                self.queue.push_back(Ok(TextPiece { id: tok, text }));
            }
            if let Some(cb) = &self.opts.on_batch { cb(&batch_texts); }
            self.count += batch.actual_count;
            if let Some(&last) = batch.tokens.last() { self.last_token = last; }
            Ok(batch.stopped || self.should_stop_on_text())
        } else {
            let outcome = self.pipeline.decode_step(self.last_token, &self.history, &self.opts)?;
            self.emit(outcome.token);
            self.history.push(outcome.token);
            self.last_token = outcome.token;
            self.count += 1;
            Ok(outcome.stopped || self.should_stop_on_text())
        }
    }
}

impl<'a> Drop for GenerationStream<'a> {
    fn drop(&mut self) {
        if self.guard_held {
            self.pipeline.end_generation();
        }
    }
}

impl<'a> Stream for GenerationStream<'a> {
    type Item = Result<TextPiece>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(piece) = this.queue.pop_front() {
            return Poll::Ready(Some(piece));
        }

        loop {
            match this.phase {
                Phase::Done => return Poll::Ready(None),
                Phase::NotStarted => {
                    if let Err(e) = this.pipeline.begin_generation() {
                        this.phase = Phase::Done;
                        return Poll::Ready(Some(Err(e)));
                    }
                    this.guard_held = true;
                    this.phase = Phase::Running;
                    if let Err(e) = this.start() {
                        this.phase = Phase::Done;
                        this.pipeline.end_generation();
                        this.guard_held = false;
                        return Poll::Ready(Some(Err(e)));
                    }
                    if this.count >= this.opts.max_tokens || this.should_stop_on_text() {
                        this.phase = Phase::Done;
                    }
                    if let Some(piece) = this.queue.pop_front() {
                        return Poll::Ready(Some(piece));
                    }
                    // max_tokens == 0: nothing was emitted, fall through to Done.
                }
                Phase::Running => {
                    if this.opts.cancellation.is_cancelled() {
                        this.phase = Phase::Done;
                        return Poll::Ready(Some(Err(RunnerError::Cancelled)));
                    }
                    match this.step() {
                        Ok(stop) => {
                            if stop || this.count >= this.opts.max_tokens {
                                this.phase = Phase::Done;
                            }
                            if let Some(piece) = this.queue.pop_front() {
                                return Poll::Ready(Some(piece));
                            }
                        }
                        Err(e) => {
                            this.phase = Phase::Done;
                            return Poll::Ready(Some(Err(e)));
                        }
                    }
                }
            }
        }
    }
}

/// Drives prefill then repeated decode steps against `pipeline`, yielding
/// each token as it's produced. No work happens until the returned stream is
/// polled, and no more than one step's worth of work happens per poll.
#[instrument(skip(pipeline, detok, prompt_tokens, opts))]
pub async fn generate<'a>(
    pipeline: &'a mut Pipeline,
    detok: &'a dyn Detokenizer,
    prompt_tokens: &[u32],
    opts: GenerationOptions,
) -> Result<GenerationStream<'a>> {
    Ok(GenerationStream::new(pipeline, detok, prompt_tokens, opts))
}

/// Synchronous, eager equivalent of [`generate`]: runs prefill and decode to
/// completion under a single `generating` guard and returns the fully
/// materialized list of pieces. Useful for callers with no async runtime at
/// hand; `generate`'s lazy stream is preferred wherever cancellation or
/// backpressure matters.
pub fn generate_sync(
    pipeline: &mut Pipeline,
    detok: &dyn Detokenizer,
    prompt_tokens: &[u32],
    opts: GenerationOptions,
) -> Result<Vec<Result<TextPiece>>> {
    pipeline.begin_generation()?;
    let result = generate_sync_body(pipeline, detok, prompt_tokens, &opts);
    pipeline.end_generation();
    result
}

fn generate_sync_body(
    pipeline: &mut Pipeline,
    detok: &dyn Detokenizer,
    prompt_tokens: &[u32],
    opts: &GenerationOptions,
) -> Result<Vec<Result<TextPiece>>> {
    let mut out = Vec::new();
    if opts.max_tokens == 0 {
        return Ok(out);
    }
    let outcome = pipeline.prefill_body(prompt_tokens, opts)?;
    let mut history: Vec<u32> = prompt_tokens.to_vec();
    let mut generated_text = String::new();

    let mut emit = |pipeline_token: u32, out: &mut Vec<Result<TextPiece>>| {
        let text = detok.detokenize_one(pipeline_token);
        generated_text.push_str(&text);
        if let Some(cb) = &opts.on_token { cb(&text); }
        out.push(Ok(TextPiece { id: pipeline_token, text }));
    };

    emit(outcome.first_token, &mut out);
    history.push(outcome.first_token);
    let mut count = 1usize;
    let mut last_token = outcome.first_token;

    while count < opts.max_tokens {
        if opts.cancellation.is_cancelled() {
            out.push(Err(RunnerError::Cancelled));
            break;
        }
        if opts.batch_size > 1 {
            let remaining = opts.batch_size.min(opts.max_tokens - count);
            let mut batch_opts = opts.clone();
            batch_opts.batch_size = remaining;
            let batch = pipeline.decode_batch(last_token, history.clone(), &batch_opts)?;
            let mut batch_texts = Vec::with_capacity(batch.tokens.len());
            for &tok in &batch.tokens {
                let text = detok.detokenize_one(tok);
                batch_texts.push(text.clone());
                generated_text.push_str(&text);
                history.push(tok);
                if let Some(cb) = &opts.on_token { cb(&text); }
                out.push(Ok(TextPiece { id: tok, text }));
            }
            if let Some(cb) = &opts.on_batch { cb(&batch_texts); }
            count += batch.actual_count;
            if let Some(&last) = batch.tokens.last() { last_token = last; }
            if batch.stopped || matches_stop_sequence(&generated_text, &opts.stop_sequences).is_some() {
                break;
            }
        } else {
            let step = pipeline.decode_step(last_token, &history, opts)?;
            emit(step.token, &mut out);
            history.push(step.token);
            last_token = step.token;
            count += 1;
            if step.stopped || matches_stop_sequence(&generated_text, &opts.stop_sequences).is_some() {
                break;
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use runner_backend::device::{ComputeBackend, SimulatedDevice};
    use runner_common::config::KvCacheConfig;
    use std::sync::Arc;
    use tokio_stream::StreamExt;

    fn manifest() -> Manifest {
        Manifest {
            model_id: "demo".into(),
            architecture: "demo".into(),
            num_layers: 1,
            hidden_size: 8,
            num_heads: 2,
            num_kv_heads: 2,
            head_dim: 4,
            intermediate_size: 16,
            vocab_size: 16,
            max_seq_len: 32,
            rope_theta: 10000.0,
            rope_scale: 1.0,
            rope_scaling_type: crate::manifest::RopeScalingType::None,
            rope_local_theta: None,
            rms_norm_eps: 1e-5,
            stop_token_ids: vec![1],
            tokenizer: crate::manifest::TokenizerSpec { kind: "bpe".into(), vocab_size: Some(16) },
            quantization: None,
            shards: vec![],
            optimizations: Default::default(),
            inference: Default::default(),
            scale_embeddings: false,
            final_logit_softcapping: None,
            use_tied_embeddings: false,
            use_moe: false,
        }
    }

    #[tokio::test]
    async fn streams_tokens_until_max_tokens() {
        let device: Arc<dyn ComputeBackend> = Arc::new(SimulatedDevice::new(8, 16, 1));
        let mut pipeline = Pipeline::new(device);
        pipeline.load_model(&manifest(), &KvCacheConfig::default()).unwrap();
        let mut opts = GenerationOptions::default();
        opts.max_tokens = 3;
        let mut stream = generate(&mut pipeline, &EchoDetokenizer, &[5, 6], opts).await.unwrap();
        let mut pieces = Vec::new();
        while let Some(item) = stream.next().await {
            pieces.push(item.unwrap());
        }
        assert!(pieces.len() <= 3);
        assert!(!pieces.is_empty());
    }

    #[tokio::test]
    async fn zero_max_tokens_yields_nothing() {
        let device: Arc<dyn ComputeBackend> = Arc::new(SimulatedDevice::new(8, 16, 1));
        let mut pipeline = Pipeline::new(device);
        pipeline.load_model(&manifest(), &KvCacheConfig::default()).unwrap();
        let mut opts = GenerationOptions::default();
        opts.max_tokens = 0;
        let mut stream = generate(&mut pipeline, &EchoDetokenizer, &[5, 6], opts).await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_the_stream_early_releases_the_generating_guard() {
        let device: Arc<dyn ComputeBackend> = Arc::new(SimulatedDevice::new(8, 16, 1));
        let mut pipeline = Pipeline::new(device);
        pipeline.load_model(&manifest(), &KvCacheConfig::default()).unwrap();
        let mut opts = GenerationOptions::default();
        opts.max_tokens = 50;
        {
            let mut stream = generate(&mut pipeline, &EchoDetokenizer, &[5, 6], opts).await.unwrap();
            assert!(stream.next().await.is_some());
            // stream dropped here, mid-generation
        }
        // a fresh generation must be accepted, proving the guard was released
        let mut opts2 = GenerationOptions::default();
        opts2.max_tokens = 1;
        let mut stream2 = generate(&mut pipeline, &EchoDetokenizer, &[5, 6], opts2).await.unwrap();
        assert!(stream2.next().await.is_some());
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_steps_not_only_up_front() {
        let device: Arc<dyn ComputeBackend> = Arc::new(SimulatedDevice::new(8, 16, 1));
        let mut pipeline = Pipeline::new(device);
        pipeline.load_model(&manifest(), &KvCacheConfig::default()).unwrap();
        let mut opts = GenerationOptions::default();
        opts.max_tokens = 50;
        let cancel = opts.cancellation.clone();
        let mut stream = generate(&mut pipeline, &EchoDetokenizer, &[5, 6], opts).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.text.is_empty());
        cancel.cancel();
        let next = stream.next().await.unwrap();
        assert!(matches!(next, Err(RunnerError::Cancelled)));
        assert!(stream.next().await.is_none());
    }
}
