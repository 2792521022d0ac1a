//! The inference pipeline: owns the per-load state (model config, KV cache,
//! decode buffers, decode ring, RoPE tables) and drives prefill/decode.
//!
//! Kernel bodies are an external collaborator (the bound [`ComputeBackend`]);
//! this module owns orchestration only — phase sequencing, KV bookkeeping,
//! ring reuse, early-stop detection, profiling spans.

use std::sync::Arc;

use runner_backend::device::{BufferHandle, BufferUsage, ComputeBackend, RecordedOp};
use runner_common::config::{KvCacheConfig, KvDtype as ConfigKvDtype, KvLayoutKind};
use runner_common::{Result, RunnerError};
use tracing::{info, warn};

use crate::buffer_pool::BufferPool;
use crate::decode_buffers::DecodeBufferManager;
use crate::decode_ring::{DecodeRing, DecodeRingConfig};
use crate::kv_cache::{KvCache, KvCacheParams, KvDtype};
use crate::manifest::{Manifest, ModelConfig};
use crate::options::GenerationOptions;
use crate::progress::{NoopProgressSink, ProgressSink};
use crate::recorder::{BatchedRecorder, ImmediateRecorder, Recorder};
use crate::rope::RopeCache;
use crate::sampler;
use crate::weights::WeightMap;

#[derive(Debug, Clone)]
pub struct TextPiece {
    pub id: u32,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct KvSnapshot {
    pub cache: KvCache,
    pub tokens: Vec<u32>,
    pub seq_len: usize,
}

/// Per-call introspection returned alongside a prefill/decode outcome. Exists
/// so a caller can tell when the fused GPU sampling path silently skipped
/// `repetition_penalty` rather than being misled into thinking it ran, and
/// so `opts.benchmark` callers get timing back instead of it only reaching
/// the `runner-obs` histograms.
#[derive(Debug, Clone, Default)]
pub struct GenerationStats {
    pub repetition_penalty_applied: bool,
    pub prefill_ms: Option<f64>,
    pub decode_ms: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct PrefillOutcome {
    pub first_token: u32,
    pub seq_len: usize,
    pub stats: GenerationStats,
}

#[derive(Debug, Clone)]
pub struct DecodeStepOutcome {
    pub token: u32,
    pub stopped: bool,
    pub stats: GenerationStats,
}

#[derive(Debug, Clone)]
pub struct BatchDecodeOutcome {
    pub tokens: Vec<u32>,
    pub actual_count: usize,
    pub stopped: bool,
    pub stats: GenerationStats,
}

pub struct Pipeline {
    device: Arc<dyn ComputeBackend>,
    pool: Arc<BufferPool>,
    model: Option<ModelConfig>,
    weights: WeightMap,
    kv: Option<KvCache>,
    decode_buffers: Option<DecodeBufferManager>,
    decode_ring: DecodeRing,
    rope_cache: RopeCache,
    progress: Arc<dyn ProgressSink>,
    generating: bool,
    uses_immediate_recorder: bool,
}

impl Pipeline {
    /// `initialize`: binds the device handle the rest of the pipeline's
    /// lifetime will use. No model is loaded yet.
    pub fn new(device: Arc<dyn ComputeBackend>) -> Self {
        let pool = BufferPool::new(device.clone());
        let ring = DecodeRing::new(device.clone());
        Self {
            device,
            pool,
            model: None,
            weights: WeightMap::new(),
            kv: None,
            decode_buffers: None,
            decode_ring: ring,
            rope_cache: RopeCache::new(),
            progress: Arc::new(NoopProgressSink),
            generating: false,
            uses_immediate_recorder: false,
        }
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn is_loaded(&self) -> bool { self.model.is_some() }

    pub fn model(&self) -> Result<&ModelConfig> { self.model.as_ref().ok_or(RunnerError::NotLoaded) }

    /// `load_model`: parses and validates the manifest, builds the RoPE
    /// table, allocates the KV cache and decode buffers, loads weights and
    /// fuses Q/K/V. Re-entrant loads while a model is already bound are
    /// rejected. `percent` follows the `[0, 1]` convention the rest of the
    /// `ProgressSink` protocol uses, not 0–100.
    pub fn load_model(&mut self, manifest: &Manifest, kv_config: &KvCacheConfig) -> Result<()> {
        if self.model.is_some() {
            return Err(RunnerError::InvalidConfig("a model is already loaded; call unload first".into()));
        }
        self.progress.on_stage("parsing_manifest", 0.0, "validating manifest");
        let model = ModelConfig::from_manifest(manifest)?;

        self.progress.on_stage("building_rope_table", 0.20, "precomputing RoPE frequencies");
        self.rope_cache.get_or_build(model.head_dim, model.rope_theta, model.rope_scale, model.rope_scaling_type, model.rope_local_theta);

        self.progress.on_stage("allocating_kv_cache", 0.45, "allocating KV cache");
        let kv_dtype = match kv_config.kv_dtype { ConfigKvDtype::F16 => KvDtype::F16, ConfigKvDtype::F32 => KvDtype::F32 };
        let params = KvCacheParams {
            num_layers: model.num_layers,
            num_kv_heads: model.num_kv_heads,
            head_dim: model.head_dim,
            max_seq_len: model.max_seq_len,
            kv_dtype,
            window_size: kv_config.window_size,
            page_size: kv_config.page_size,
            basis_vocab_size: kv_config.bdpa_vocab_size,
        };
        let (kv, uses_immediate) = match kv_config.layout {
            KvLayoutKind::Contiguous => (KvCache::new_contiguous(params), false),
            KvLayoutKind::SlidingWindow => (KvCache::new_sliding_window(params)?, false),
            KvLayoutKind::Paged => (KvCache::new_paged(params)?, false),
            // BDPA refuses recorder-based ingestion unconditionally (design
            // note §9): command batching is disabled for the whole load.
            KvLayoutKind::Bdpa => (KvCache::new_bdpa(params)?, true),
        };

        self.progress.on_stage("allocating_decode_buffers", 0.75, "allocating ping-pong buffers");
        let activation_bytes = 4;
        let decode_buffers = DecodeBufferManager::new(self.device.clone(), model.hidden_size, model.intermediate_size, activation_bytes);

        self.kv = Some(kv);
        self.decode_buffers = Some(decode_buffers);
        self.uses_immediate_recorder = uses_immediate;
        self.model = Some(model.clone());
        self.weights.clear();
        for layer in 0..model.num_layers {
            self.weights.fuse_qkv(
                &format!("model.layers.{layer}.self_attn.qkv_proj"),
                &format!("model.layers.{layer}.self_attn.q_proj"),
                &format!("model.layers.{layer}.self_attn.k_proj"),
                &format!("model.layers.{layer}.self_attn.v_proj"),
            );
        }
        runner_obs::set_kv_cache_layout(match kv_config.layout {
            KvLayoutKind::Contiguous => 0,
            KvLayoutKind::SlidingWindow => 1,
            KvLayoutKind::Paged => 2,
            KvLayoutKind::Bdpa => 3,
        });
        self.progress.on_stage("ready", 1.0, "model loaded");
        info!("model loaded");
        Ok(())
    }

    pub fn reset(&mut self) {
        if let Some(kv) = &mut self.kv { kv.clear(); }
        if let Some(buffers) = &mut self.decode_buffers { buffers.reset_ping_pong(); }
        self.decode_ring.reset();
    }

    pub fn unload(&mut self) {
        if let Some(mut buffers) = self.decode_buffers.take() { buffers.release(); }
        self.decode_ring.release();
        self.kv = None;
        self.weights.clear();
        self.model = None;
    }

    /// Marks a generation in flight. `pub(crate)` (rather than folded into
    /// `prefill`/`prefill_kv_only` only) so [`crate::generator::GenerationStream`]
    /// and [`crate::generator::generate_sync`] can hold the guard across their
    /// whole prefill+decode call instead of just the prefill leg.
    pub(crate) fn begin_generation(&mut self) -> Result<()> {
        if self.generating { return Err(RunnerError::AlreadyGenerating); }
        self.generating = true;
        Ok(())
    }

    pub(crate) fn end_generation(&mut self) {
        self.generating = false;
    }

    fn make_recorder(&self, profiling: bool) -> Box<dyn Recorder> {
        if self.uses_immediate_recorder {
            Box::new(ImmediateRecorder::new(self.device.clone(), self.pool.clone(), profiling))
        } else {
            Box::new(BatchedRecorder::new(self.device.clone(), self.pool.clone(), profiling))
        }
    }

    fn kv_width(&self, model: &ModelConfig) -> usize { model.num_kv_heads * model.head_dim }

    /// Placeholder K/V content: kernels that actually project Q/K/V are an
    /// external collaborator (out of scope), so the pipeline manufactures a
    /// deterministic per-(layer, position, token) vector instead — enough to
    /// exercise KV bookkeeping, overflow, and layout-specific indexing.
    fn synth_kv(&self, layer: usize, position: usize, token: u32, width: usize) -> Vec<f32> {
        let mut state = (token as u64) ^ ((position as u64) << 20) ^ ((layer as u64) << 40) ^ 0x9E3779B97F4A7C15;
        (0..width)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                (((state >> 33) % 2000) as f32 / 1000.0) - 1.0
            })
            .collect()
    }

    /// Records the per-layer transform for `tokens` starting at `start_pos`,
    /// appending each layer's (synthesized) K/V to the KV cache as it goes,
    /// and returns the handle holding the final layer's output.
    ///
    /// `hidden_in`/`hidden_out` alternate every layer (true ping-pong) rather
    /// than being fixed for the whole call — layer `i+1` must read layer
    /// `i`'s output, not the original embedding — so which of the two
    /// handles ends up holding the real final output depends on `num_layers`'
    /// parity; callers must use the returned handle, not assume `hidden_out`.
    ///
    /// Flushes and restarts `recorder` immediately after any layer index
    /// present in `debug_layers`, so a caller can read back intermediate
    /// hidden state between checkpoints instead of only the final output.
    fn run_layers_and_append_kv(
        &mut self,
        recorder: &mut Box<dyn Recorder>,
        tokens: &[u32],
        start_pos: usize,
        mut hidden_in: BufferHandle,
        mut hidden_out: BufferHandle,
        debug_layers: &[usize],
        profiling: bool,
    ) -> Result<BufferHandle> {
        let model = self.model.as_ref().ok_or(RunnerError::NotLoaded)?.clone();
        let width = self.kv_width(&model);
        for layer in 0..model.num_layers {
            recorder.record(RecordedOp::Layer { layer, hidden_in, hidden_out, position: start_pos });
            for (i, &tok) in tokens.iter().enumerate() {
                let pos = start_pos + i;
                let k = self.synth_kv(layer, pos, tok, width);
                let v = self.synth_kv(layer, pos, tok.wrapping_add(1), width);
                let kv = self.kv.as_mut().ok_or(RunnerError::NotLoaded)?;
                kv.update_from_gpu(layer, &k, &v, pos, 1, Some(&[tok]))?;
            }
            if debug_layers.contains(&layer) {
                let finished = std::mem::replace(recorder, self.make_recorder(profiling));
                finished.submit()?;
            }
            if layer + 1 < model.num_layers {
                std::mem::swap(&mut hidden_in, &mut hidden_out);
            }
        }
        Ok(hidden_out)
    }

    /// Prefill algorithm (verbatim sequence): embed → per-layer transform +
    /// KV append → final logits → repetition penalty → sample first token.
    pub fn prefill(&mut self, prompt_tokens: &[u32], opts: &GenerationOptions) -> Result<PrefillOutcome> {
        self.begin_generation()?;
        let result = self.prefill_body(prompt_tokens, opts);
        self.end_generation();
        result
    }

    pub(crate) fn prefill_body(&mut self, prompt_tokens: &[u32], opts: &GenerationOptions) -> Result<PrefillOutcome> {
        let model = self.model.as_ref().ok_or(RunnerError::NotLoaded)?.clone();
        if prompt_tokens.is_empty() {
            return Err(RunnerError::InvalidConfig("prefill requires at least one token".into()));
        }

        let mut recorder = self.make_recorder(opts.profile);
        let hidden_bytes = model.hidden_size * prompt_tokens.len() * 4;
        let hidden_a = self.pool.acquire(hidden_bytes, BufferUsage::Storage);
        let hidden_b = self.pool.acquire(hidden_bytes, BufferUsage::Storage);
        let scale = if model.scale_embeddings { Some((model.hidden_size as f32).sqrt()) } else { None };
        recorder.record(RecordedOp::Embed { tokens: prompt_tokens.to_vec(), out: hidden_a, scale });

        let final_hidden = self.run_layers_and_append_kv(
            &mut recorder, prompt_tokens, 0, hidden_a, hidden_b, &opts.debug_layers, opts.profile,
        )?;

        let logits_bytes = model.vocab_size * prompt_tokens.len() * 4;
        let logits = self.pool.acquire(logits_bytes, BufferUsage::Storage);
        recorder.record(RecordedOp::Logits { hidden: final_hidden, num_tokens: prompt_tokens.len(), out: logits });
        recorder.track_temporary(hidden_a, hidden_bytes, BufferUsage::Storage);
        recorder.track_temporary(hidden_b, hidden_bytes, BufferUsage::Storage);
        recorder.track_temporary(logits, logits_bytes, BufferUsage::Storage);
        let submit_started = std::time::Instant::now();
        recorder.submit()?;
        let elapsed_ms = submit_started.elapsed().as_secs_f64() * 1000.0;

        let last_logits = self.device.read_f32(logits, model.vocab_size * prompt_tokens.len());
        runner_obs::observe_prefill_ms(elapsed_ms);
        let row = sampler::last_row(&last_logits, model.vocab_size).to_vec();
        let first_token = self.sample_cpu(&row, &[], opts, &model);

        let stats = GenerationStats {
            repetition_penalty_applied: true,
            prefill_ms: if opts.benchmark { Some(elapsed_ms) } else { None },
            decode_ms: None,
        };
        Ok(PrefillOutcome { first_token, seq_len: prompt_tokens.len(), stats })
    }

    fn sample_cpu(&self, logits: &[f32], history: &[u32], opts: &GenerationOptions, model: &ModelConfig) -> u32 {
        let mut logits = logits.to_vec();
        if let Some(cap) = model.final_logit_softcapping { sampler::apply_softcap(&mut logits, cap); }
        sampler::apply_repetition_penalty(&mut logits, history, opts.repetition_penalty);
        let picked = if opts.temperature <= opts.greedy_threshold {
            sampler::sample_greedy(&logits)
        } else {
            sampler::sample_top_k_top_p_seeded(&logits, opts.top_k, opts.top_p, opts.temperature, opts.seed)
        };
        picked as u32
    }

    /// Records a GPU-side sample op writing the chosen token id into
    /// `out_token`, into the same recorder the preceding `Logits` op went
    /// into, so no CPU round trip happens before a following step can read
    /// it back. Ignores `repetition_penalty` — the fused kernel has no
    /// CPU-side penalty pass; a non-unity penalty forces callers onto the
    /// non-fused path instead (§9, a documented limitation, not a bug).
    fn sample_fused(&self, recorder: &mut Box<dyn Recorder>, logits: BufferHandle, logits_bytes: usize, out_token: BufferHandle) {
        recorder.record(RecordedOp::Sample { logits, out_token });
        recorder.track_temporary(logits, logits_bytes, BufferUsage::Storage);
    }

    fn fused_path_available(&self, opts: &GenerationOptions) -> bool {
        self.device.supports_fused_sampling()
            && self.device.supports_gpu_logits()
            && !self.uses_immediate_recorder
            && opts.repetition_penalty == 1.0
    }

    /// Single-token decode step: new recorder + ping-pong buffers each call,
    /// fused sampling when the device supports it and BDPA isn't in play.
    pub fn decode_step(&mut self, last_token: u32, history: &[u32], opts: &GenerationOptions) -> Result<DecodeStepOutcome> {
        let model = self.model.as_ref().ok_or(RunnerError::NotLoaded)?.clone();
        let start_pos = self.kv.as_ref().ok_or(RunnerError::NotLoaded)?.current_seq_len();

        let buffers = self.decode_buffers.as_mut().ok_or(RunnerError::NotLoaded)?;
        buffers.reset_ping_pong();
        let hidden_in = buffers.current_hidden();
        let hidden_out = buffers.output_hidden();

        let mut recorder = self.make_recorder(opts.profile);
        recorder.record(RecordedOp::Embed { tokens: vec![last_token], out: hidden_in, scale: if model.scale_embeddings { Some((model.hidden_size as f32).sqrt()) } else { None } });
        let final_hidden = self.run_layers_and_append_kv(
            &mut recorder, &[last_token], start_pos, hidden_in, hidden_out, &opts.debug_layers, opts.profile,
        )?;

        let logits_bytes = model.vocab_size * 4;
        let logits = self.pool.acquire(logits_bytes, BufferUsage::Storage);
        recorder.record(RecordedOp::Logits { hidden: final_hidden, num_tokens: 1, out: logits });

        let fused = self.fused_path_available(opts) && opts.debug_layers.is_empty();
        let submit_started = std::time::Instant::now();
        let sampled = if fused {
            let tok_buf = self.pool.acquire(4, BufferUsage::Staging);
            self.sample_fused(&mut recorder, logits, logits_bytes, tok_buf);
            recorder.submit()?;
            self.device.read_u32(tok_buf, 1).first().copied().unwrap_or(0)
        } else {
            recorder.track_temporary(logits, logits_bytes, BufferUsage::Storage);
            recorder.submit()?;
            let row = self.device.read_f32(logits, model.vocab_size);
            self.sample_cpu(&row, history, opts, &model)
        };
        let elapsed_ms = submit_started.elapsed().as_secs_f64() * 1000.0;
        runner_obs::observe_decode_ms(elapsed_ms);

        let stopped = crate::chat_template::is_stop_token(sampled, &model.stop_token_ids);
        let stats = GenerationStats {
            repetition_penalty_applied: !fused,
            prefill_ms: None,
            decode_ms: if opts.benchmark { Some(elapsed_ms) } else { None },
        };
        Ok(DecodeStepOutcome { token: sampled, stopped, stats })
    }

    /// Batched multi-token decode. Dispatches to a true single-submit
    /// GPU-fused path when the device and options allow it, else falls back
    /// to driving `decode_step` sequentially (BDPA, a non-unity repetition
    /// penalty, `disable_batching`, or `debug_layers` checkpoints all force
    /// the fallback — none of those can be satisfied inside one recorded
    /// batch).
    pub fn decode_batch(&mut self, last_token: u32, history: Vec<u32>, opts: &GenerationOptions) -> Result<BatchDecodeOutcome> {
        let model = self.model.as_ref().ok_or(RunnerError::NotLoaded)?.clone();
        let n = opts.batch_size.max(1);
        let ring_cfg = DecodeRingConfig {
            batch_size: n,
            tokens_per_interval: n,
            stop_check_mode: opts.stop_check_mode,
            ring_tokens: n,
            ring_stop: n,
            ring_staging: n,
            max_buffer_bytes: 1 << 24,
        };
        self.decode_ring.ensure(ring_cfg)?;
        let reuses_before = self.decode_ring.stats().tokens.reuses;

        let fused = self.fused_path_available(opts) && !opts.disable_batching && opts.debug_layers.is_empty();
        let outcome = if fused {
            self.decode_batch_fused(last_token, n, opts, &model)
        } else {
            self.decode_batch_sequential(last_token, history, n, opts, &model)
        }?;

        let reuses_after = self.decode_ring.stats().tokens.reuses;
        if reuses_after > reuses_before {
            runner_obs::record_decode_ring_reuses((reuses_after - reuses_before) as u64);
        }
        Ok(outcome)
    }

    /// One recorder, N chained steps, one `submit()` — matches the batched
    /// -decode algorithm verbatim: preallocate `N+1` single-token buffers,
    /// seed slot 0, record N (embed → layers → logits → sample-into-next
    /// -slot) iterations, submit once, then read every slot back. KV append
    /// for step `i` needs that step's *input* token, which for `i > 0` is
    /// only known once the whole batch has executed — so KV bookkeeping
    /// happens in a CPU-side follow-up pass after readback, not interleaved
    /// with recording, and only for the steps kept after the first stop.
    fn decode_batch_fused(&mut self, last_token: u32, n: usize, opts: &GenerationOptions, model: &ModelConfig) -> Result<BatchDecodeOutcome> {
        let start_pos = self.kv.as_ref().ok_or(RunnerError::NotLoaded)?.current_seq_len();
        let scale = if model.scale_embeddings { Some((model.hidden_size as f32).sqrt()) } else { None };
        let hidden_bytes = model.hidden_size * 4;
        let logits_bytes = model.vocab_size * 4;

        let mut recorder = self.make_recorder(opts.profile);
        let tok_bufs: Vec<BufferHandle> = (0..=n).map(|_| self.pool.acquire(4, BufferUsage::Staging)).collect();
        self.device.write_u32(tok_bufs[0], &[last_token]);

        for i in 0..n {
            let mut hidden_in = self.pool.acquire(hidden_bytes, BufferUsage::Storage);
            let mut hidden_out = self.pool.acquire(hidden_bytes, BufferUsage::Storage);
            recorder.record(RecordedOp::EmbedFromToken { token_buf: tok_bufs[i], out: hidden_in, scale });
            for layer in 0..model.num_layers {
                recorder.record(RecordedOp::Layer { layer, hidden_in, hidden_out, position: start_pos + i });
                if layer + 1 < model.num_layers {
                    std::mem::swap(&mut hidden_in, &mut hidden_out);
                }
            }
            let final_hidden = hidden_out;
            let logits = self.pool.acquire(logits_bytes, BufferUsage::Storage);
            recorder.record(RecordedOp::Logits { hidden: final_hidden, num_tokens: 1, out: logits });
            self.sample_fused(&mut recorder, logits, logits_bytes, tok_bufs[i + 1]);
            recorder.track_temporary(hidden_in, hidden_bytes, BufferUsage::Storage);
            recorder.track_temporary(final_hidden, hidden_bytes, BufferUsage::Storage);
        }
        for &buf in &tok_bufs {
            recorder.track_temporary(buf, 4, BufferUsage::Staging);
        }

        let submit_started = std::time::Instant::now();
        recorder.submit()?;
        let elapsed_ms = submit_started.elapsed().as_secs_f64() * 1000.0;
        runner_obs::observe_decode_ms(elapsed_ms);

        let slots: Vec<u32> = tok_bufs.iter().map(|&b| self.device.read_u32(b, 1).first().copied().unwrap_or(0)).collect();

        let width = self.kv_width(model);
        let mut tokens = Vec::with_capacity(n);
        let mut stopped = false;
        for i in 0..n {
            let pos = start_pos + i;
            let input_token = slots[i];
            let sampled_token = slots[i + 1];
            for layer in 0..model.num_layers {
                let k = self.synth_kv(layer, pos, input_token, width);
                let v = self.synth_kv(layer, pos, input_token.wrapping_add(1), width);
                let kv = self.kv.as_mut().ok_or(RunnerError::NotLoaded)?;
                kv.update_from_gpu(layer, &k, &v, pos, 1, Some(&[input_token]))?;
            }
            self.decode_ring.acquire();
            self.decode_ring.advance();
            tokens.push(sampled_token);
            let seq_len = self.kv.as_ref().map(|k| k.current_seq_len()).unwrap_or(0);
            let is_stop = crate::chat_template::is_stop_token(sampled_token, &model.stop_token_ids);
            if is_stop || model.max_seq_len <= seq_len {
                stopped = true;
                break;
            }
        }

        let actual_count = tokens.len();
        let stats = GenerationStats {
            repetition_penalty_applied: false,
            prefill_ms: None,
            decode_ms: if opts.benchmark { Some(elapsed_ms) } else { None },
        };
        Ok(BatchDecodeOutcome { tokens, actual_count, stopped, stats })
    }

    /// Fallback path: drives `decode_step` N times, one recorder + submit per
    /// token. Output is bit-identical to N individual `decode_step` calls.
    fn decode_batch_sequential(&mut self, last_token: u32, mut history: Vec<u32>, n: usize, opts: &GenerationOptions, model: &ModelConfig) -> Result<BatchDecodeOutcome> {
        let mut tokens = Vec::with_capacity(n);
        let mut current = last_token;
        let mut stopped = false;
        let mut decode_ms_total = 0.0f64;
        let mut any_penalty_applied = false;
        for _ in 0..n {
            if opts.cancellation.is_cancelled() {
                return Err(RunnerError::Cancelled);
            }
            self.decode_ring.acquire();
            let outcome = match self.decode_step(current, &history, opts) {
                Ok(o) => o,
                Err(RunnerError::CacheOverflow(msg)) => {
                    warn!(error = %msg, "batch path fell back to single-token decode");
                    return Err(RunnerError::BatchFallback(msg));
                }
                Err(e) => return Err(e),
            };
            self.decode_ring.advance();
            any_penalty_applied |= outcome.stats.repetition_penalty_applied;
            if let Some(ms) = outcome.stats.decode_ms { decode_ms_total += ms; }
            tokens.push(outcome.token);
            history.push(outcome.token);
            current = outcome.token;
            let seq_len = self.kv.as_ref().map(|k| k.current_seq_len()).unwrap_or(0);
            if outcome.stopped || model.max_seq_len <= seq_len {
                stopped = true;
                break;
            }
        }

        let actual_count = tokens.len();
        let stats = GenerationStats {
            repetition_penalty_applied: any_penalty_applied,
            prefill_ms: None,
            decode_ms: if opts.benchmark { Some(decode_ms_total) } else { None },
        };
        Ok(BatchDecodeOutcome { tokens, actual_count, stopped, stats })
    }

    /// Prefill without sampling a first token — used to warm a KV cache that
    /// a later `generate_with_prefix_kv` call resumes from.
    pub fn prefill_kv_only(&mut self, prompt_tokens: &[u32]) -> Result<KvSnapshot> {
        self.begin_generation()?;
        let result = self.prefill_kv_only_body(prompt_tokens);
        self.end_generation();
        result
    }

    fn prefill_kv_only_body(&mut self, prompt_tokens: &[u32]) -> Result<KvSnapshot> {
        let model = self.model.as_ref().ok_or(RunnerError::NotLoaded)?.clone();
        if prompt_tokens.is_empty() {
            return Err(RunnerError::InvalidConfig("prefill_kv_only requires at least one token".into()));
        }
        let mut recorder = self.make_recorder(false);
        let hidden_bytes = model.hidden_size * prompt_tokens.len() * 4;
        let hidden_a = self.pool.acquire(hidden_bytes, BufferUsage::Storage);
        let hidden_b = self.pool.acquire(hidden_bytes, BufferUsage::Storage);
        recorder.record(RecordedOp::Embed { tokens: prompt_tokens.to_vec(), out: hidden_a, scale: None });
        self.run_layers_and_append_kv(&mut recorder, prompt_tokens, 0, hidden_a, hidden_b, &[], false)?;
        recorder.track_temporary(hidden_a, hidden_bytes, BufferUsage::Storage);
        recorder.track_temporary(hidden_b, hidden_bytes, BufferUsage::Storage);
        recorder.submit()?;

        let kv = self.kv.as_ref().ok_or(RunnerError::NotLoaded)?;
        Ok(KvSnapshot { cache: kv.clone_cache(), tokens: prompt_tokens.to_vec(), seq_len: kv.current_seq_len() })
    }

    /// Rebinds a previously captured snapshot as this pipeline's live cache.
    /// The snapshot's tokens are not re-embedded — their KV is resident.
    pub fn resume_from_snapshot(&mut self, snapshot: KvSnapshot) {
        self.kv = Some(snapshot.cache);
    }
}
