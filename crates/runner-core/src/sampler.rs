//! Token sampling and logits extraction for the non-fused decode path.
//!
//! Fused-path sampling (argmax baked into a `RecordedOp::Sample`) lives in
//! the compute backend; repetition penalty has no effect there, since the
//! fused kernel never sees token history (documented limitation, §9).

use rand::prelude::*;

/// Extracts the row for `token_index` out of a `[num_tokens, vocab_size]`
/// flat logits buffer. Decode steps always want the last row.
pub fn extract_logits_row(logits: &[f32], vocab_size: usize, token_index: usize) -> &[f32] {
    let start = token_index * vocab_size;
    &logits[start..start + vocab_size]
}

pub fn last_row(logits: &[f32], vocab_size: usize) -> &[f32] {
    let num_tokens = logits.len() / vocab_size;
    extract_logits_row(logits, vocab_size, num_tokens - 1)
}

/// Multiplicative/divisive repetition penalty (Keskar et al. convention):
/// logits of previously-seen tokens are divided by `penalty` when positive,
/// multiplied when negative. `penalty == 1.0` is a no-op, so re-applying is
/// idempotent only for that value — applying any `penalty != 1.0` twice is
/// not idempotent, which is why pipelines apply it exactly once per step.
pub fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f32) {
    if penalty == 1.0 { return; }
    let mut seen = std::collections::HashSet::new();
    for &tok in history {
        if !seen.insert(tok) { continue; }
        let idx = tok as usize;
        if idx >= logits.len() { continue; }
        let l = logits[idx];
        logits[idx] = if l > 0.0 { l / penalty } else { l * penalty };
    }
}

/// Caps logit magnitude before softmax, matching decode kernels that clamp
/// via `tanh(logit / cap) * cap` to avoid overflow on long contexts.
pub fn apply_softcap(logits: &mut [f32], cap: f32) {
    if cap <= 0.0 { return; }
    for l in logits.iter_mut() {
        *l = (*l / cap).tanh() * cap;
    }
}

pub fn sample_greedy(logits: &[f32]) -> usize {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
        .map(|(i, _)| i)
        .unwrap_or(0)
}

pub fn sample_top_k_top_p<R: Rng + ?Sized>(
    logits: &[f32],
    top_k: usize,
    top_p: f32,
    temperature: f32,
    rng: &mut R,
) -> usize {
    if logits.is_empty() { return 0; }
    if temperature <= 0.0 { return sample_greedy(logits); }
    let mut pairs: Vec<(usize, f32)> = logits.iter().enumerate().map(|(i, &l)| (i, l / temperature.max(1e-4))).collect();
    pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
    let mut cutoff = pairs.len();
    if top_k > 0 { cutoff = cutoff.min(top_k); }
    let mut sum = 0.0_f32;
    let mut probs: Vec<(usize, f32)> = Vec::with_capacity(cutoff);
    for &(i, l) in &pairs[..cutoff] {
        let p = l.exp();
        probs.push((i, p));
        sum += p;
    }
    probs.iter_mut().for_each(|p| p.1 /= sum.max(1e-9));
    if top_p < 1.0 {
        probs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let mut acc = 0.0_f32;
        let mut keep = 0;
        for &(_, p) in &probs { acc += p; keep += 1; if acc >= top_p { break; } }
        probs.truncate(keep.max(1));
        let z: f32 = probs.iter().map(|p| p.1).sum();
        for p in &mut probs { p.1 /= z.max(1e-9); }
    }
    let r: f32 = rng.gen();
    let mut acc = 0.0_f32;
    for (i, p) in &probs { acc += p; if r <= acc { return *i; } }
    pairs[0].0
}

pub fn sample_top_k_top_p_seeded(logits: &[f32], top_k: usize, top_p: f32, temperature: f32, seed: Option<u64>) -> usize {
    let mut rng: StdRng = match seed { Some(s) => SeedableRng::seed_from_u64(s), None => StdRng::from_entropy() };
    sample_top_k_top_p(logits, top_k, top_p, temperature, &mut rng)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_row_picks_final_token_position() {
        let logits = vec![0.0, 1.0, 2.0, 3.0];
        assert_eq!(last_row(&logits, 2), &[2.0, 3.0]);
    }

    #[test]
    fn greedy_picks_argmax() {
        assert_eq!(sample_greedy(&[0.1, 5.0, -2.0]), 1);
    }

    #[test]
    fn repetition_penalty_is_noop_at_unity() {
        let mut logits = vec![1.0, 2.0, 3.0];
        let before = logits.clone();
        apply_repetition_penalty(&mut logits, &[0, 1], 1.0);
        assert_eq!(logits, before);
    }

    #[test]
    fn repetition_penalty_suppresses_seen_positive_logits() {
        let mut logits = vec![4.0, -4.0, 1.0];
        apply_repetition_penalty(&mut logits, &[0, 1], 2.0);
        assert_eq!(logits[0], 2.0);
        assert_eq!(logits[1], -8.0);
        assert_eq!(logits[2], 1.0);
    }

    #[test]
    fn softcap_bounds_logit_magnitude() {
        let mut logits = vec![1000.0, -1000.0, 0.0];
        apply_softcap(&mut logits, 10.0);
        assert!(logits[0] <= 10.0 && logits[0] > 9.9);
        assert!(logits[1] >= -10.0 && logits[1] < -9.9);
        assert_eq!(logits[2], 0.0);
    }

    #[test]
    fn seeded_sampling_is_deterministic() {
        let logits = vec![0.1, 0.2, 5.0, 0.05];
        let a = sample_top_k_top_p_seeded(&logits, 4, 1.0, 1.0, Some(7));
        let b = sample_top_k_top_p_seeded(&logits, 4, 1.0, 1.0, Some(7));
        assert_eq!(a, b);
    }

    #[test]
    fn zero_temperature_is_greedy() {
        let logits = vec![0.1, 9.0, -3.0];
        assert_eq!(sample_top_k_top_p_seeded(&logits, 0, 1.0, 0.0, Some(1)), 1);
    }
}
