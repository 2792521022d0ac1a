//! Command Recorder: a `Recorder` trait implemented by `BatchedRecorder`
//! (default — defers temp-buffer release to submit-completion) and
//! `ImmediateRecorder` (debug mode / `disable_command_batching` — releases
//! inline). Callers record the same op sequence either way (design note §9).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use runner_backend::device::{BufferHandle, BufferUsage, ComputeBackend, RecordedOp};
use runner_common::Result;

use crate::buffer_pool::BufferPool;

pub trait Recorder {
    /// Appends an op to the recorded sequence.
    fn record(&mut self, op: RecordedOp);
    /// Registers `handle` (of `bytes` size) for release once the work that
    /// depends on it has executed. Permanent buffers (decode ping-pong,
    /// ring slots, weights) must never be passed here — their lifetime is
    /// owned elsewhere (design note §9).
    fn track_temporary(&mut self, handle: BufferHandle, bytes: usize, usage: BufferUsage);
    fn is_profiling_enabled(&self) -> bool;
    /// Flush the recorded sequence. Consumes the recorder.
    fn submit(self: Box<Self>) -> Result<RecorderOutcome>;
}

pub struct RecorderOutcome {
    pub timings: HashMap<String, Duration>,
}

struct Tracked {
    handle: BufferHandle,
    bytes: usize,
    usage: BufferUsage,
}

/// Defers every `track_temporary`'d buffer's release until after `submit`'s
/// `execute` call returns — releasing earlier would race the recorded work
/// that still reads or writes it (§4.3 discipline).
pub struct BatchedRecorder {
    device: Arc<dyn ComputeBackend>,
    pool: Arc<BufferPool>,
    ops: Vec<RecordedOp>,
    pending_release: Vec<Tracked>,
    profiling: bool,
}

impl BatchedRecorder {
    pub fn new(device: Arc<dyn ComputeBackend>, pool: Arc<BufferPool>, profiling: bool) -> Self {
        Self { device, pool, ops: Vec::new(), pending_release: Vec::new(), profiling }
    }
}

impl Recorder for BatchedRecorder {
    fn record(&mut self, op: RecordedOp) { self.ops.push(op); }

    fn track_temporary(&mut self, handle: BufferHandle, bytes: usize, usage: BufferUsage) {
        self.pending_release.push(Tracked { handle, bytes, usage });
    }

    fn is_profiling_enabled(&self) -> bool { self.profiling }

    fn submit(self: Box<Self>) -> Result<RecorderOutcome> {
        let report = self.device.execute(&self.ops)?;
        for t in &self.pending_release {
            self.pool.release(t.bytes, t.usage, t.handle);
        }
        Ok(RecorderOutcome { timings: report.timings })
    }
}

/// Executes each recorded op immediately rather than batching, and releases
/// `track_temporary`'d buffers right away — used when command batching is
/// disabled (debug checkpoints, profiling that needs precise boundaries, or
/// BDPA KV updates, which refuse recorder-based ingestion entirely and so
/// must run with batching off).
pub struct ImmediateRecorder {
    device: Arc<dyn ComputeBackend>,
    pool: Arc<BufferPool>,
    timings: HashMap<String, Duration>,
    profiling: bool,
}

impl ImmediateRecorder {
    pub fn new(device: Arc<dyn ComputeBackend>, pool: Arc<BufferPool>, profiling: bool) -> Self {
        Self { device, pool, timings: HashMap::new(), profiling }
    }
}

impl Recorder for ImmediateRecorder {
    fn record(&mut self, op: RecordedOp) {
        if let Ok(report) = self.device.execute(std::slice::from_ref(&op)) {
            self.timings.extend(report.timings);
        }
    }

    fn track_temporary(&mut self, handle: BufferHandle, bytes: usize, usage: BufferUsage) {
        self.pool.release(bytes, usage, handle);
    }

    fn is_profiling_enabled(&self) -> bool { self.profiling }

    fn submit(self: Box<Self>) -> Result<RecorderOutcome> {
        Ok(RecorderOutcome { timings: self.timings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_backend::device::SimulatedDevice;

    fn device() -> Arc<dyn ComputeBackend> { Arc::new(SimulatedDevice::new(4, 8, 1)) }

    #[test]
    fn batched_recorder_releases_after_submit() {
        let dev = device();
        let pool = BufferPool::new(dev.clone());
        let handle = pool.acquire(32, BufferUsage::Storage);
        let mut rec = Box::new(BatchedRecorder::new(dev, pool.clone(), false));
        rec.track_temporary(handle, 32, BufferUsage::Storage);
        rec.submit().unwrap();
        // released buffer is reusable from the pool again
        let reused = pool.acquire(32, BufferUsage::Storage);
        assert_eq!(handle, reused);
    }

    #[test]
    fn immediate_recorder_executes_per_op() {
        let dev = device();
        let pool = BufferPool::new(dev.clone());
        let logits = pool.acquire(32, BufferUsage::Storage);
        let tok = pool.acquire(4, BufferUsage::Staging);
        dev.write_f32(logits, &[0.0, 1.0, 0.5, -1.0]);
        let mut rec = Box::new(ImmediateRecorder::new(dev.clone(), pool, false));
        rec.record(RecordedOp::Sample { logits, out_token: tok });
        rec.submit().unwrap();
        assert_eq!(dev.read_u32(tok, 1), vec![1]);
    }
}
