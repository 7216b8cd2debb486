//! Per-call sampling configuration
//!
//! Grounded on `original_source`'s `SamplingConfig` dataclass (field names
//! and defaults) and on the teacher's `inference/params.rs::SamplingParams`
//! for the validation idiom (one `RuntimeError::InvalidParameters` per
//! violated precondition).

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};

/// A value that is either a single scalar broadcast to every batch element,
/// or an explicit per-batch vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerBatch<T> {
    Scalar(T),
    Vector(Vec<T>),
}

impl<T: Copy> PerBatch<T> {
    /// Materialize into a `batch_size`-length vector, broadcasting scalars.
    pub fn broadcast(&self, batch_size: usize) -> Result<Vec<T>> {
        match self {
            PerBatch::Scalar(v) => Ok(vec![*v; batch_size]),
            PerBatch::Vector(v) => {
                if v.len() != batch_size {
                    return Err(RuntimeError::InvalidParameters(format!(
                        "per-batch tensor has length {} but batch size is {}",
                        v.len(),
                        batch_size
                    )));
                }
                Ok(v.clone())
            }
        }
    }
}

/// Per-call sampling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub end_id: i32,
    pub pad_id: i32,

    pub max_new_tokens: usize,
    pub num_beams: usize,
    pub max_attention_window_size: Option<usize>,

    pub stop_words_list: Option<Vec<Vec<String>>>,
    pub bad_words_list: Option<Vec<Vec<String>>>,

    pub temperature: PerBatch<f32>,
    pub top_k: PerBatch<i32>,
    pub top_p: PerBatch<f32>,
    pub top_p_decay: Option<PerBatch<f32>>,
    pub top_p_min: Option<PerBatch<f32>>,
    pub top_p_reset_ids: Option<PerBatch<i32>>,

    pub length_penalty: PerBatch<f32>,
    pub repetition_penalty: Option<PerBatch<f32>>,
    pub presence_penalty: Option<PerBatch<f32>>,
    pub min_length: PerBatch<i32>,

    pub beam_search_diversity_rate: Option<PerBatch<f32>>,
    pub random_seed: Option<u64>,

    pub output_sequence_lengths: bool,
    pub return_dict: bool,
    pub use_beam_hyps: bool,
    pub output_cum_log_probs: bool,
    pub output_log_probs: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            end_id: 0,
            pad_id: 0,
            max_new_tokens: 20,
            num_beams: 1,
            max_attention_window_size: None,
            stop_words_list: None,
            bad_words_list: None,
            temperature: PerBatch::Scalar(1.0),
            top_k: PerBatch::Scalar(1),
            top_p: PerBatch::Scalar(0.0),
            top_p_decay: None,
            top_p_min: None,
            top_p_reset_ids: None,
            length_penalty: PerBatch::Scalar(1.0),
            repetition_penalty: None,
            presence_penalty: None,
            min_length: PerBatch::Scalar(1),
            beam_search_diversity_rate: None,
            random_seed: None,
            output_sequence_lengths: false,
            return_dict: false,
            use_beam_hyps: true,
            output_cum_log_probs: false,
            output_log_probs: false,
        }
    }
}

impl SamplingConfig {
    pub fn new(end_id: i32, pad_id: i32) -> Self {
        Self {
            end_id,
            pad_id,
            ..Default::default()
        }
    }

    pub fn with_beams(mut self, num_beams: usize) -> Self {
        self.num_beams = num_beams;
        self
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Mirrors `SamplingConfig.update(**kwargs)` in `original_source`: applies
    /// a partial override without reconstructing defaults for unset fields.
    pub fn update_temperature(mut self, temperature: f32) -> Self {
        self.temperature = PerBatch::Scalar(temperature);
        self
    }

    pub fn update_top_k_top_p(mut self, top_k: i32, top_p: f32) -> Self {
        self.top_k = PerBatch::Scalar(top_k);
        self.top_p = PerBatch::Scalar(top_p);
        self
    }

    /// Validate scalar/structural invariants independent of batch size.
    /// `validate_batch` below additionally checks per-batch vector lengths.
    pub fn validate(&self) -> Result<()> {
        if self.max_new_tokens == 0 {
            return Err(RuntimeError::InvalidParameters(
                "max_new_tokens must be greater than 0".to_string(),
            ));
        }
        if self.num_beams == 0 {
            return Err(RuntimeError::InvalidParameters(
                "num_beams must be at least 1".to_string(),
            ));
        }

        let repetition_non_default = matches!(
            &self.repetition_penalty,
            Some(PerBatch::Scalar(v)) if *v != 1.0
        ) || matches!(&self.repetition_penalty, Some(PerBatch::Vector(_)));
        let presence_non_default = matches!(
            &self.presence_penalty,
            Some(PerBatch::Scalar(v)) if *v != 0.0
        ) || matches!(&self.presence_penalty, Some(PerBatch::Vector(_)));

        if repetition_non_default && presence_non_default {
            return Err(RuntimeError::InvalidParameters(
                "repetition_penalty and presence_penalty are mutually exclusive as non-default values"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// `max_attention_window_size` resolved against `max_seq_length`,
    /// clamping and warning exactly as `GenerationSession::setup` does in
    /// `original_source`.
    pub fn resolved_attention_window(&self, max_seq_length: usize) -> usize {
        match self.max_attention_window_size {
            None => {
                tracing::debug!(
                    max_seq_length,
                    "max_attention_window_size not set, defaulting to max_seq_length"
                );
                max_seq_length
            }
            Some(w) if w > max_seq_length => {
                tracing::warn!(
                    requested = w,
                    max_seq_length,
                    "max_attention_window_size exceeds max_seq_length, clamping"
                );
                max_seq_length
            }
            Some(w) => w,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_dataclass() {
        let cfg = SamplingConfig::default();
        assert_eq!(cfg.max_new_tokens, 20);
        assert_eq!(cfg.num_beams, 1);
        assert!(cfg.use_beam_hyps);
    }

    #[test]
    fn rejects_conflicting_penalties() {
        let mut cfg = SamplingConfig::new(0, 0);
        cfg.repetition_penalty = Some(PerBatch::Scalar(1.2));
        cfg.presence_penalty = Some(PerBatch::Scalar(0.5));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn allows_single_non_default_penalty() {
        let mut cfg = SamplingConfig::new(0, 0);
        cfg.repetition_penalty = Some(PerBatch::Scalar(1.2));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn broadcast_rejects_length_mismatch() {
        let per_batch = PerBatch::Vector(vec![1.0, 2.0]);
        assert!(per_batch.broadcast(3).is_err());
        assert_eq!(per_batch.broadcast(2).unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn window_clamped_to_max_seq_length() {
        let mut cfg = SamplingConfig::new(0, 0);
        cfg.max_attention_window_size = Some(9999);
        assert_eq!(cfg.resolved_attention_window(128), 128);
    }
}
