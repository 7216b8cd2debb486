//! Dynamic decoder adapter: penalties, top-k/top-p sampling, beam-search
//! expansion, and beam-hypotheses bookkeeping (§4.4).
//!
//! Grounded on `original_source`'s `SamplingConfig`-driven decode step and on
//! the teacher's sampler-chain idiom in `inference/engine.rs` (building a
//! `LlamaSampler` chain from `SamplingParams` field-by-field) — here
//! generalized to operate over plain logits slices instead of a concrete
//! llama.cpp sampler, since the sampling kernel itself is an external
//! collaborator (§1).

use crate::error::{Result, RuntimeError};
use crate::sampling_config::{PerBatch, SamplingConfig};
use std::collections::HashMap;

/// A completed beam candidate recorded for early-termination decisions.
#[derive(Debug, Clone)]
pub struct BeamHypothesis {
    pub token_ids: Vec<i32>,
    pub cum_log_prob: f32,
    pub normalized_score: f32,
}

/// Per-batch-element store of completed beam candidates (§4.5's
/// "beam hypotheses": the top-2K completed candidates with normalized
/// scores, used to decide early termination).
#[derive(Debug, Clone, Default)]
pub struct BeamHypotheses {
    per_batch: HashMap<usize, Vec<BeamHypothesis>>,
}

impl BeamHypotheses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, batch: usize, hyp: BeamHypothesis) {
        self.per_batch.entry(batch).or_default().push(hyp);
    }

    pub fn best_for_batch(&self, batch: usize) -> Option<&BeamHypothesis> {
        self.per_batch
            .get(&batch)?
            .iter()
            .max_by(|a, b| a.normalized_score.partial_cmp(&b.normalized_score).unwrap())
    }

    pub fn is_done(&self, batch: usize, beam_width: usize) -> bool {
        self.per_batch.get(&batch).map(|v| v.len() >= 2 * beam_width).unwrap_or(false)
    }

    /// Deep copy, used by streaming `finalize_decoder(in_progress=true)` so
    /// an intermediate `gather_tree` call cannot mutate live decoder state.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }
}

/// Length-penalty normalization: `cum_log_prob / length^length_penalty`,
/// matching the standard beam-search scoring used throughout
/// `original_source`.
pub fn normalized_score(cum_log_prob: f32, length: usize, length_penalty: f32) -> f32 {
    if length == 0 {
        return cum_log_prob;
    }
    cum_log_prob / (length as f32).powf(length_penalty)
}

/// Per-batch materialized sampling parameters, the result of
/// `DynamicDecoder::setup`.
pub struct DecoderParams {
    pub top_k: Vec<i32>,
    pub top_p: Vec<f32>,
    pub temperature: Vec<f32>,
    pub repetition_penalty: Option<Vec<f32>>,
    pub presence_penalty: Option<Vec<f32>>,
    pub min_length: Vec<i32>,
    pub length_penalty: Vec<f32>,
    pub beam_search_diversity_rate: Option<Vec<f32>>,
}

/// One decode-step invocation's mutable session state the decoder reads
/// and writes in place, mirroring the prose contract's `forward(...)`
/// signature.
pub struct DecodeStepState<'a> {
    pub output_ids: &'a mut [i32],
    pub new_tokens: &'a mut [i32],
    pub parent_ids: &'a mut [i32],
    pub sequence_length_buffer: &'a mut [i32],
    pub cum_log_probs: &'a mut [f32],
    pub finished: &'a mut [bool],
}

/// Wraps the external sampling kernel. Constructed on the last pipeline
/// rank with the model's vocabulary sizing; casts non-f32/f16 logits to
/// f32 (warn once), though this crate always operates on f32 logits since
/// dtype lowering belongs to the engine/backend.
pub struct DynamicDecoder {
    vocab_size: usize,
    vocab_size_padded: usize,
    params: Option<DecoderParams>,
    pub beam_hyps: BeamHypotheses,
}

impl DynamicDecoder {
    pub fn new(vocab_size: usize, vocab_size_padded: usize) -> Self {
        Self {
            vocab_size,
            vocab_size_padded,
            params: None,
            beam_hyps: BeamHypotheses::new(),
        }
    }

    pub fn setup(&mut self, batch_size: usize, cfg: &SamplingConfig) -> Result<()> {
        let top_k = cfg.top_k.broadcast(batch_size)?;
        let top_p = cfg.top_p.broadcast(batch_size)?;
        let temperature = cfg.temperature.broadcast(batch_size)?;
        let min_length = cfg.min_length.broadcast(batch_size)?;
        let length_penalty = cfg.length_penalty.broadcast(batch_size)?;
        let repetition_penalty = match &cfg.repetition_penalty {
            Some(p) => Some(p.broadcast(batch_size)?),
            None => None,
        };
        let presence_penalty = match &cfg.presence_penalty {
            Some(p) => Some(p.broadcast(batch_size)?),
            None => None,
        };
        let beam_search_diversity_rate = match &cfg.beam_search_diversity_rate {
            Some(p) => Some(p.broadcast(batch_size)?),
            None => None,
        };

        self.params = Some(DecoderParams {
            top_k,
            top_p,
            temperature,
            repetition_penalty,
            presence_penalty,
            min_length,
            length_penalty,
            beam_search_diversity_rate,
        });
        Ok(())
    }

    /// Apply repetition/presence penalty, min-length masking, temperature
    /// scaling in place, in that order, matching §4.4's processing pipeline.
    pub fn apply_penalties(
        &self,
        batch: usize,
        logits: &mut [f32],
        previous_tokens: &[i32],
        decode_step: usize,
        end_id: i32,
    ) {
        let params = self.params.as_ref().expect("setup must be called before decoding");

        if let Some(rep) = &params.repetition_penalty {
            let penalty = rep[batch];
            if penalty != 1.0 {
                for &tok in previous_tokens {
                    if let Some(l) = logits.get_mut(tok as usize) {
                        *l = if *l > 0.0 { *l / penalty } else { *l * penalty };
                    }
                }
            }
        } else if let Some(pres) = &params.presence_penalty {
            let penalty = pres[batch];
            if penalty != 0.0 {
                let mut seen = std::collections::HashSet::new();
                for &tok in previous_tokens {
                    if seen.insert(tok) {
                        if let Some(l) = logits.get_mut(tok as usize) {
                            *l -= penalty;
                        }
                    }
                }
            }
        }

        if (decode_step as i32) < params.min_length[batch] {
            if let Some(l) = logits.get_mut(end_id as usize) {
                *l = f32::NEG_INFINITY;
            }
        }

        let temperature = params.temperature[batch];
        if temperature != 1.0 && temperature > 0.0 {
            for l in logits.iter_mut() {
                *l /= temperature;
            }
        }
    }

    pub fn apply_bad_words(&self, logits: &mut [f32], bad_word_ids: &[i32]) {
        for &tok in bad_word_ids {
            if let Some(l) = logits.get_mut(tok as usize) {
                *l = f32::NEG_INFINITY;
            }
        }
    }

    /// Greedy/top-k/top-p sampling for `beam_width == 1`. Returns the
    /// sampled token id. `rng_state` is a simple xorshift state threaded by
    /// the caller so sampling is reproducible given `random_seed`.
    pub fn sample_single_beam(&self, batch: usize, logits: &[f32], rng_state: &mut u64) -> i32 {
        let params = self.params.as_ref().expect("setup must be called before decoding");
        let top_k = params.top_k[batch].max(1) as usize;
        let top_p = params.top_p[batch];

        let mut indexed: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let k = top_k.min(indexed.len()).max(1);
        let mut candidates = indexed[..k].to_vec();

        if top_p > 0.0 && top_p < 1.0 {
            softmax_in_place(&mut candidates);
            let mut cumulative = 0.0f32;
            let mut cutoff = candidates.len();
            for (i, &(_, p)) in candidates.iter().enumerate() {
                cumulative += p;
                if cumulative >= top_p {
                    cutoff = i + 1;
                    break;
                }
            }
            candidates.truncate(cutoff.max(1));
        }

        if k == 1 {
            return candidates[0].0 as i32;
        }

        softmax_in_place(&mut candidates);
        let r = next_unit_f32(rng_state);
        let mut cumulative = 0.0f32;
        for &(token, p) in &candidates {
            cumulative += p;
            if r <= cumulative {
                return token as i32;
            }
        }
        candidates.last().map(|&(t, _)| t as i32).unwrap_or(0)
    }

    /// Beam-search expansion for `beam_width > 1`: scores every
    /// `(existing beam, candidate token)` pair by
    /// `cum_log_prob + log_softmax(logits)[token] - diversity_rate * rank`,
    /// keeps the top `beam_width` survivors.
    pub fn expand_beams(
        &self,
        batch: usize,
        beam_width: usize,
        per_beam_logits: &[Vec<f32>],
        per_beam_cum_log_prob: &[f32],
    ) -> Vec<(usize, i32, f32)> {
        let params = self.params.as_ref().expect("setup must be called before decoding");
        let diversity_rate = params
            .beam_search_diversity_rate
            .as_ref()
            .map(|v| v[batch])
            .unwrap_or(0.0);

        let mut scored = Vec::new();
        for (beam, logits) in per_beam_logits.iter().enumerate() {
            let log_probs = log_softmax(logits);
            let mut ranked: Vec<(usize, f32)> = log_probs.iter().copied().enumerate().collect();
            ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

            for (rank, &(token, log_p)) in ranked.iter().take(beam_width).enumerate() {
                let score = per_beam_cum_log_prob[beam] + log_p - diversity_rate * rank as f32;
                scored.push((beam, token as i32, score));
            }
        }

        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(beam_width);
        scored
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn vocab_size_padded(&self) -> usize {
        self.vocab_size_padded
    }
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits.iter().map(|&l| (l - max).exp()).sum();
    let log_sum = sum.ln() + max;
    logits.iter().map(|&l| l - log_sum).collect()
}

fn softmax_in_place(candidates: &mut [(usize, f32)]) {
    let max = candidates.iter().map(|&(_, v)| v).fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for (_, v) in candidates.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for (_, v) in candidates.iter_mut() {
            *v /= sum;
        }
    }
}

fn next_unit_f32(state: &mut u64) -> f32 {
    // xorshift64*, sufficient for reproducible-given-seed sampling; not
    // cryptographic, matching the teacher's non-cryptographic FNV-1a use
    // for cache keys.
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    ((*state >> 11) as f32) / ((1u64 << 53) as f32)
}

/// User-supplied hook run before `forward`: `(step, output_ids, logits) ->
/// logits`. Composed via `LogitsProcessorList` in registration order,
/// matching `original_source`'s `LogitsProcessorList`.
pub trait LogitsProcessor: Send {
    fn process(&mut self, step: usize, output_ids: &[i32], logits: &mut [f32]);
}

#[derive(Default)]
pub struct LogitsProcessorList(pub Vec<Box<dyn LogitsProcessor>>);

impl LogitsProcessorList {
    pub fn apply(&mut self, step: usize, output_ids: &[i32], logits: &mut [f32]) {
        for processor in self.0.iter_mut() {
            processor.process(step, output_ids, logits);
        }
    }
}

/// User-supplied hook run after `forward`: `(step, output_ids, logits) ->
/// bool`; can force `should_stop` to true.
pub trait StoppingCriteria: Send {
    fn should_stop(&mut self, step: usize, output_ids: &[i32], logits: &[f32]) -> bool;
}

#[derive(Default)]
pub struct StoppingCriteriaList(pub Vec<Box<dyn StoppingCriteria>>);

impl StoppingCriteriaList {
    pub fn any(&mut self, step: usize, output_ids: &[i32], logits: &[f32]) -> bool {
        self.0.iter_mut().any(|c| c.should_stop(step, output_ids, logits))
    }
}

/// Validate that a decoder-construction request actually matches engine
/// dtype expectations; engines with unsupported logits dtype must cast to
/// f32 upstream (this is a configuration-time check, not a per-step one).
pub fn validate_logits_dtype(dtype: &str) -> Result<()> {
    match dtype {
        "f32" | "f16" => Ok(()),
        other => Err(RuntimeError::Configuration(format!(
            "unsupported logits dtype '{other}', expected f32 or f16 (engine must cast upstream)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling_config::SamplingConfig;

    #[test]
    fn greedy_top_k_one_is_deterministic() {
        let mut decoder = DynamicDecoder::new(10, 10);
        let cfg = SamplingConfig::new(9, 9);
        decoder.setup(1, &cfg).unwrap();

        let logits = vec![0.1, 5.0, 0.2, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let mut rng = 42u64;
        let t1 = decoder.sample_single_beam(0, &logits, &mut rng);
        let mut rng2 = 42u64;
        let t2 = decoder.sample_single_beam(0, &logits, &mut rng2);
        assert_eq!(t1, 1);
        assert_eq!(t2, 1);
    }

    #[test]
    fn repetition_penalty_and_presence_penalty_are_mutually_exclusive() {
        let mut cfg = SamplingConfig::new(0, 0);
        cfg.repetition_penalty = Some(PerBatch::Scalar(1.3));
        cfg.presence_penalty = Some(PerBatch::Scalar(0.4));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn min_length_masks_end_id_logit() {
        let mut decoder = DynamicDecoder::new(5, 5);
        let mut cfg = SamplingConfig::new(4, 4);
        cfg.min_length = PerBatch::Scalar(3);
        decoder.setup(1, &cfg).unwrap();

        let mut logits = vec![1.0, 1.0, 1.0, 1.0, 10.0];
        decoder.apply_penalties(0, &mut logits, &[], 1, 4);
        assert_eq!(logits[4], f32::NEG_INFINITY);
    }

    #[test]
    fn beam_expansion_keeps_top_beam_width_candidates() {
        let mut decoder = DynamicDecoder::new(4, 4);
        let cfg = SamplingConfig::new(3, 3).with_beams(2);
        decoder.setup(1, &cfg).unwrap();

        let per_beam_logits = vec![vec![5.0, 0.0, 0.0, 0.0], vec![0.0, 0.0, 5.0, 0.0]];
        let cum = vec![0.0, 0.0];
        let expanded = decoder.expand_beams(0, 2, &per_beam_logits, &cum);
        assert_eq!(expanded.len(), 2);
    }

    #[test]
    fn normalized_score_matches_length_penalty_formula() {
        let score = normalized_score(-4.0, 4, 1.0);
        assert!((score - (-1.0)).abs() < 1e-6);
    }
}
