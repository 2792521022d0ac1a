use std::sync::Arc;

use runner_backend::device::{ComputeBackend, SimulatedDevice};
use runner_common::config::{KvCacheConfig, KvDtype, KvLayoutKind};
use runner_common::RunnerError;
use runner_core::manifest::{InferencePresetSpec, Manifest, OptimizationsSpec, RopeScalingType, TokenizerSpec};
use runner_core::options::GenerationOptions;
use runner_core::pipeline::Pipeline;

fn manifest(max_seq_len: usize, stop_token_ids: Vec<u32>) -> Manifest {
    Manifest {
        model_id: "test-model".into(),
        architecture: "test".into(),
        num_layers: 2,
        hidden_size: 16,
        num_heads: 4,
        num_kv_heads: 4,
        head_dim: 4,
        intermediate_size: 32,
        vocab_size: 32,
        max_seq_len,
        rope_theta: 10000.0,
        rope_scale: 1.0,
        rope_scaling_type: RopeScalingType::None,
        rope_local_theta: None,
        rms_norm_eps: 1e-5,
        stop_token_ids,
        tokenizer: TokenizerSpec { kind: "bpe".into(), vocab_size: Some(32) },
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

fn device() -> Arc<dyn ComputeBackend> { Arc::new(SimulatedDevice::new(16, 32, 2)) }

fn contiguous_config() -> KvCacheConfig {
    KvCacheConfig { layout: KvLayoutKind::Contiguous, kv_dtype: KvDtype::F32, window_size: None, page_size: None, bdpa_vocab_size: None }
}

#[test]
fn greedy_prefill_is_deterministic() {
    let mut a = Pipeline::new(device());
    a.load_model(&manifest(64, vec![]), &contiguous_config()).unwrap();
    let mut b = Pipeline::new(device());
    b.load_model(&manifest(64, vec![]), &contiguous_config()).unwrap();

    let opts = GenerationOptions { temperature: 0.0, ..GenerationOptions::default() };
    let out_a = a.prefill(&[1, 2, 3], &opts).unwrap();
    let out_b = b.prefill(&[1, 2, 3], &opts).unwrap();
    assert_eq!(out_a.first_token, out_b.first_token);
    assert_eq!(out_a.seq_len, 3);
}

#[test]
fn decode_batch_matches_repeated_decode_step() {
    let opts = GenerationOptions { temperature: 0.0, batch_size: 4, ..GenerationOptions::default() };

    let mut single = Pipeline::new(device());
    single.load_model(&manifest(128, vec![]), &contiguous_config()).unwrap();
    let prefill = single.prefill(&[5, 6, 7], &opts).unwrap();
    let mut history = vec![5, 6, 7, prefill.first_token];
    let mut last = prefill.first_token;
    let mut singles = Vec::new();
    for _ in 0..4 {
        let step = single.decode_step(last, &history, &opts).unwrap();
        singles.push(step.token);
        history.push(step.token);
        last = step.token;
        if step.stopped { break; }
    }

    let mut batched = Pipeline::new(device());
    batched.load_model(&manifest(128, vec![]), &contiguous_config()).unwrap();
    let prefill2 = batched.prefill(&[5, 6, 7], &opts).unwrap();
    assert_eq!(prefill.first_token, prefill2.first_token);
    let history2 = vec![5, 6, 7, prefill2.first_token];
    let batch = batched.decode_batch(prefill2.first_token, history2, &opts).unwrap();

    assert_eq!(batch.tokens, singles);
}

#[test]
fn decode_batch_stops_early_on_eos() {
    let stop_manifest = manifest(128, vec![0]);
    let mut pipeline = Pipeline::new(device());
    pipeline.load_model(&stop_manifest, &contiguous_config()).unwrap();
    let opts = GenerationOptions { temperature: 0.0, batch_size: 16, ..GenerationOptions::default() };
    let prefill = pipeline.prefill(&[9, 10], &opts).unwrap();
    let history = vec![9, 10, prefill.first_token];
    let batch = pipeline.decode_batch(prefill.first_token, history, &opts).unwrap();
    assert!(batch.actual_count <= 16);
}

#[test]
fn sliding_window_layout_loads_and_decodes() {
    let cfg = KvCacheConfig { layout: KvLayoutKind::SlidingWindow, kv_dtype: KvDtype::F32, window_size: Some(8), page_size: None, bdpa_vocab_size: None };
    let mut pipeline = Pipeline::new(device());
    pipeline.load_model(&manifest(64, vec![]), &cfg).unwrap();
    let opts = GenerationOptions { temperature: 0.0, ..GenerationOptions::default() };
    let prefill = pipeline.prefill(&(0..12).collect::<Vec<u32>>(), &opts).unwrap();
    assert_eq!(prefill.seq_len, 12);
}

#[test]
fn snapshot_round_trips_into_a_fresh_pipeline() {
    let mut warm = Pipeline::new(device());
    warm.load_model(&manifest(64, vec![]), &contiguous_config()).unwrap();
    let snapshot = warm.prefill_kv_only(&[1, 2, 3, 4]).unwrap();
    assert_eq!(snapshot.seq_len, 4);

    let mut resumed = Pipeline::new(device());
    resumed.load_model(&manifest(64, vec![]), &contiguous_config()).unwrap();
    resumed.resume_from_snapshot(snapshot);

    let opts = GenerationOptions { temperature: 0.0, ..GenerationOptions::default() };
    let step = resumed.decode_step(4, &[1, 2, 3, 4], &opts).unwrap();
    assert!(step.token < 32);
}

#[test]
fn reentrant_prefill_is_rejected_only_while_in_flight() {
    let mut pipeline = Pipeline::new(device());
    pipeline.load_model(&manifest(64, vec![]), &contiguous_config()).unwrap();
    let opts = GenerationOptions::default();
    // sequential calls succeed: the generating flag resets after each call
    assert!(pipeline.prefill(&[1], &opts).is_ok());
    assert!(pipeline.prefill(&[2], &opts).is_ok());
}

#[test]
fn prefill_rejects_empty_prompt() {
    let mut pipeline = Pipeline::new(device());
    pipeline.load_model(&manifest(64, vec![]), &contiguous_config()).unwrap();
    let opts = GenerationOptions::default();
    assert!(matches!(pipeline.prefill(&[], &opts), Err(RunnerError::InvalidConfig(_))));
}

#[test]
fn operations_before_load_model_fail_with_not_loaded() {
    let mut pipeline = Pipeline::new(device());
    let opts = GenerationOptions::default();
    assert!(matches!(pipeline.prefill(&[1], &opts), Err(RunnerError::NotLoaded)));
}

#[test]
fn bdpa_layout_forces_immediate_recorder_and_still_decodes() {
    let cfg = KvCacheConfig { layout: KvLayoutKind::Bdpa, kv_dtype: KvDtype::F32, window_size: None, page_size: Some(4), bdpa_vocab_size: Some(16) };
    let mut pipeline = Pipeline::new(device());
    pipeline.load_model(&manifest(64, vec![]), &cfg).unwrap();
    let opts = GenerationOptions { temperature: 0.0, ..GenerationOptions::default() };
    let prefill = pipeline.prefill(&[1, 2, 3], &opts).unwrap();
    assert_eq!(prefill.seq_len, 3);
}

#[test]
fn repeated_reset_is_idempotent() {
    let mut pipeline = Pipeline::new(device());
    pipeline.load_model(&manifest(64, vec![]), &contiguous_config()).unwrap();
    let opts = GenerationOptions { temperature: 0.0, ..GenerationOptions::default() };
    pipeline.prefill(&[1, 2], &opts).unwrap();
    pipeline.reset();
    pipeline.reset();
    let prefill = pipeline.prefill(&[1, 2], &opts).unwrap();
    assert_eq!(prefill.seq_len, 2);
}
