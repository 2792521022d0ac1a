//! GPU-resident compute surface consumed by the inference core.
//!
//! The actual kernel bodies (matmul, attention, norms, softmax, gather,
//! argmax, sampling) are external collaborators per the core's scope — this
//! module only defines the interface a [`ComputeBackend`] must expose so the
//! core's command recorder, buffer pool, and decode loop can record and
//! submit work without knowing which concrete device executes it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use runner_common::Result;

/// Opaque handle into a [`ComputeBackend`]'s buffer table. Handles are never
/// dereferenced by callers — only passed back to the backend that issued
/// them — so the pool and recorder can hold them without borrowing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

/// A buffer size rounded up to the backend's allocation granularity. Pairing
/// `(SizeClass, BufferUsage)` is the buffer pool's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SizeClass(pub usize);

impl SizeClass {
    const BUCKET: usize = 256;

    pub fn for_bytes(bytes: usize) -> Self {
        SizeClass(((bytes + Self::BUCKET - 1) / Self::BUCKET) * Self::BUCKET)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Storage,
    Staging,
    Uniform,
}

/// Dtype tag for weights and KV storage, per the data model's weight map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    F16,
    F32,
    Int8,
    Q4K,
}

/// One recorded unit of work. A [`ComputeBackend::execute`] call receives a
/// batch of these in recording order and must apply them in that order
/// before returning — this is what lets the core submit once per prefill or
/// decode step instead of per kernel.
#[derive(Debug, Clone)]
pub enum RecordedOp {
    Embed { tokens: Vec<u32>, out: BufferHandle, scale: Option<f32> },
    /// Like `Embed` for a single token, except the token id is read from
    /// `token_buf` at execute time rather than carried in the op itself —
    /// lets a batched decode chain step `i+1`'s embed off step `i`'s `Sample`
    /// output within one recorded batch, with no CPU round trip between them.
    EmbedFromToken { token_buf: BufferHandle, out: BufferHandle, scale: Option<f32> },
    Layer { layer: usize, hidden_in: BufferHandle, hidden_out: BufferHandle, position: usize },
    Logits { hidden: BufferHandle, num_tokens: usize, out: BufferHandle },
    Sample { logits: BufferHandle, out_token: BufferHandle },
    KvAppend { layer: usize, start_pos: usize },
    CheckStop { sampled: BufferHandle, out_flag: BufferHandle, eos_token: u32, generated_count: usize, max_tokens: usize },
    TimestampMark { label: String },
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub timings: HashMap<String, Duration>,
}

/// The GPU-resident compute surface. One implementation per kernel provider
/// (a simulated in-process backend for tests and the mock harness, a native
/// backend wrapping an external kernel library in production).
pub trait ComputeBackend: Send + Sync {
    fn hidden_size(&self) -> usize;
    fn vocab_size(&self) -> usize;
    fn num_layers(&self) -> usize;

    fn alloc(&self, size_class: SizeClass, usage: BufferUsage) -> BufferHandle;
    fn free(&self, handle: BufferHandle);

    fn write_f32(&self, handle: BufferHandle, data: &[f32]);
    fn read_f32(&self, handle: BufferHandle, len: usize) -> Vec<f32>;
    fn write_u32(&self, handle: BufferHandle, data: &[u32]);
    fn read_u32(&self, handle: BufferHandle, len: usize) -> Vec<u32>;

    /// Apply a recorded batch in order. This is the single submit point: a
    /// caller records N ops then calls `execute` once, mirroring a real
    /// command-buffer submit.
    fn execute(&self, ops: &[RecordedOp]) -> Result<ExecutionReport>;

    /// Whether `Sample` ops can be recorded into the same batch as `Logits`
    /// (the fused decode path) rather than requiring a CPU round trip.
    fn supports_fused_sampling(&self) -> bool;
    /// Whether logits can be computed GPU-side at all (`record_logits_gpu`).
    fn supports_gpu_logits(&self) -> bool;
}

/// An in-process stand-in for a real GPU device. It implements the full
/// [`ComputeBackend`] contract — buffer accounting, batched submit,
/// deterministic "compute" — so the pipeline's orchestration logic (phase
/// sequencing, KV bookkeeping, ring reuse, early-stop detection) can be
/// exercised without a real kernel library. The per-op math is a
/// deterministic placeholder, not a transformer: real kernels are an
/// external collaborator per the core's scope.
pub struct SimulatedDevice {
    hidden_size: usize,
    vocab_size: usize,
    num_layers: usize,
    fused_sampling: bool,
    gpu_logits: bool,
    next_handle: AtomicU64,
    buffers: Mutex<HashMap<BufferHandle, Vec<u8>>>,
}

impl SimulatedDevice {
    pub fn new(hidden_size: usize, vocab_size: usize, num_layers: usize) -> Self {
        Self {
            hidden_size,
            vocab_size,
            num_layers,
            fused_sampling: true,
            gpu_logits: true,
            next_handle: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_fused_sampling(mut self, enabled: bool) -> Self {
        self.fused_sampling = enabled;
        self
    }

    fn fresh_handle(&self) -> BufferHandle {
        BufferHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Deterministic pseudo-embedding: every token id maps to a stable
    /// hidden-size vector via a cheap hash/splitmix walk. Good enough to
    /// exercise ping-pong buffers and KV indexing without a real embedding
    /// table.
    fn fake_embed(&self, token: u32, position: usize) -> Vec<f32> {
        let mut state = splitmix64(token as u64 ^ ((position as u64) << 32));
        (0..self.hidden_size)
            .map(|_| {
                state = splitmix64(state);
                ((state % 2000) as f32 / 1000.0) - 1.0
            })
            .collect()
    }

    fn fake_layer_transform(&self, layer: usize, position: usize, hidden: &[f32]) -> Vec<f32> {
        let bias = ((layer + 1) as f32) * 0.001 + ((position + 1) as f32) * 0.0001;
        hidden.iter().map(|v| (v + bias).tanh()).collect()
    }

    fn fake_logits(&self, hidden: &[f32]) -> Vec<f32> {
        (0..self.vocab_size)
            .map(|vocab_id| {
                let mut acc = 0.0f32;
                for (i, h) in hidden.iter().enumerate() {
                    let w = (((vocab_id * 31 + i) % 997) as f32 / 997.0) - 0.5;
                    acc += h * w;
                }
                acc
            })
            .collect()
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

impl ComputeBackend for SimulatedDevice {
    fn hidden_size(&self) -> usize { self.hidden_size }
    fn vocab_size(&self) -> usize { self.vocab_size }
    fn num_layers(&self) -> usize { self.num_layers }

    fn alloc(&self, size_class: SizeClass, _usage: BufferUsage) -> BufferHandle {
        let handle = self.fresh_handle();
        self.buffers.lock().unwrap().insert(handle, vec![0u8; size_class.0]);
        handle
    }

    fn free(&self, handle: BufferHandle) {
        self.buffers.lock().unwrap().remove(&handle);
    }

    fn write_f32(&self, handle: BufferHandle, data: &[f32]) {
        let mut bytes = Vec::with_capacity(data.len() * 4);
        for v in data { bytes.extend_from_slice(&v.to_le_bytes()); }
        self.buffers.lock().unwrap().insert(handle, bytes);
    }

    fn read_f32(&self, handle: BufferHandle, len: usize) -> Vec<f32> {
        let guard = self.buffers.lock().unwrap();
        let Some(bytes) = guard.get(&handle) else { return vec![0.0; len] };
        bytes.chunks_exact(4).take(len).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
    }

    fn write_u32(&self, handle: BufferHandle, data: &[u32]) {
        let mut bytes = Vec::with_capacity(data.len() * 4);
        for v in data { bytes.extend_from_slice(&v.to_le_bytes()); }
        self.buffers.lock().unwrap().insert(handle, bytes);
    }

    fn read_u32(&self, handle: BufferHandle, len: usize) -> Vec<u32> {
        let guard = self.buffers.lock().unwrap();
        let Some(bytes) = guard.get(&handle) else { return vec![0; len] };
        bytes.chunks_exact(4).take(len).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
    }

    fn execute(&self, ops: &[RecordedOp]) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::default();
        for (i, op) in ops.iter().enumerate() {
            match op {
                RecordedOp::Embed { tokens, out, scale } => {
                    let mut hidden = Vec::with_capacity(tokens.len() * self.hidden_size);
                    for (pos, &tok) in tokens.iter().enumerate() {
                        let mut v = self.fake_embed(tok, pos);
                        if let Some(s) = scale { v.iter_mut().for_each(|x| *x *= s); }
                        hidden.extend(v);
                    }
                    self.write_f32(*out, &hidden);
                }
                RecordedOp::EmbedFromToken { token_buf, out, scale } => {
                    let tok = self.read_u32(*token_buf, 1).first().copied().unwrap_or(0);
                    let mut v = self.fake_embed(tok, 0);
                    if let Some(s) = scale { v.iter_mut().for_each(|x| *x *= s); }
                    self.write_f32(*out, &v);
                }
                RecordedOp::Layer { layer, hidden_in, hidden_out, position } => {
                    let hidden = self.read_f32(*hidden_in, self.hidden_size);
                    let out = self.fake_layer_transform(*layer, *position, &hidden);
                    self.write_f32(*hidden_out, &out);
                }
                RecordedOp::Logits { hidden, num_tokens, out } => {
                    let hs = self.read_f32(*hidden, self.hidden_size * num_tokens);
                    let mut logits = Vec::with_capacity(self.vocab_size * num_tokens);
                    for chunk in hs.chunks(self.hidden_size) {
                        logits.extend(self.fake_logits(chunk));
                    }
                    self.write_f32(*out, &logits);
                }
                RecordedOp::Sample { logits, out_token } => {
                    let values = self.read_f32(*logits, self.vocab_size);
                    let best = values
                        .iter()
                        .enumerate()
                        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                        .map(|(i, _)| i as u32)
                        .unwrap_or(0);
                    self.write_u32(*out_token, &[best]);
                }
                RecordedOp::KvAppend { .. } => {}
                RecordedOp::CheckStop { sampled, out_flag, eos_token, generated_count, max_tokens } => {
                    let tok = self.read_u32(*sampled, 1).first().copied().unwrap_or(0);
                    let stop = tok == *eos_token || generated_count >= max_tokens;
                    self.write_u32(*out_flag, &[stop as u32]);
                }
                RecordedOp::TimestampMark { label } => {
                    report.timings.insert(label.clone(), Duration::from_micros(i as u64));
                }
            }
        }
        Ok(report)
    }

    fn supports_fused_sampling(&self) -> bool { self.fused_sampling }
    fn supports_gpu_logits(&self) -> bool { self.gpu_logits }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_round_trips_f32() {
        let dev = SimulatedDevice::new(4, 8, 2);
        let h = dev.alloc(SizeClass::for_bytes(16), BufferUsage::Storage);
        dev.write_f32(h, &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(dev.read_f32(h, 4), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn embed_is_deterministic() {
        let dev = SimulatedDevice::new(4, 8, 2);
        let a = dev.fake_embed(7, 0);
        let b = dev.fake_embed(7, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn sample_picks_argmax() {
        let dev = SimulatedDevice::new(4, 4, 1);
        let logits = dev.alloc(SizeClass::for_bytes(16), BufferUsage::Storage);
        let tok = dev.alloc(SizeClass::for_bytes(4), BufferUsage::Staging);
        dev.write_f32(logits, &[0.1, 0.9, -0.2, 0.05]);
        dev.execute(&[RecordedOp::Sample { logits, out_token: tok }]).unwrap();
        assert_eq!(dev.read_u32(tok, 1), vec![1]);
    }

    #[test]
    fn embed_from_token_chains_off_a_sample_written_earlier_in_the_same_batch() {
        let dev = SimulatedDevice::new(4, 4, 1);
        let logits = dev.alloc(SizeClass::for_bytes(16), BufferUsage::Storage);
        let step0_tok = dev.alloc(SizeClass::for_bytes(4), BufferUsage::Staging);
        let step1_tok = dev.alloc(SizeClass::for_bytes(4), BufferUsage::Staging);
        let hidden = dev.alloc(SizeClass::for_bytes(16), BufferUsage::Storage);
        dev.write_f32(logits, &[0.1, 0.9, -0.2, 0.05]);
        dev.write_u32(step0_tok, &[0]);
        // a single batch: sample a token, then embed the NEXT step from the
        // buffer that sample just wrote, with no readback in between.
        dev.execute(&[
            RecordedOp::Sample { logits, out_token: step1_tok },
            RecordedOp::EmbedFromToken { token_buf: step1_tok, out: hidden, scale: None },
        ])
        .unwrap();
        let expected = dev.fake_embed(1, 0);
        assert_eq!(dev.read_f32(hidden, 4), expected);
    }
}
