//! Model-variant strategy: per-architecture quirks in how context/generation
//! inputs are assembled (§ REDESIGN FLAGS).
//!
//! `original_source` expresses this as a small class hierarchy
//! (`GenerationSession` subclassed by `ChatGlmGenerationSession`,
//! `QWenForCausalLMGenerationSession`, ...), each overriding a couple of
//! input-preparation methods. The REDESIGN FLAG calls for a flat strategy
//! enum instead of inheritance; grounded on the teacher's `model/config.rs`
//! enum-dispatch pattern (`ModelBackend`/`ModelArchitecture` matched in
//! `loader.rs`) rather than trait-object subclassing.

use crate::backend::DevicePtr;

/// Extra, architecture-specific tensors a variant may need bound alongside
/// the common input set.
#[derive(Debug, Clone, Default)]
pub struct VariantExtraInputs {
    pub position_ids: Option<Vec<i32>>,
    pub block_position_ids: Option<Vec<i32>>,
    pub attention_mask: Option<DevicePtr>,
}

/// The architectures `original_source` special-cases. `Standard` covers the
/// common GPT-style path; `ChatGlm` and `Qwen` carry the deltas their
/// subclasses used to implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    Standard,
    ChatGlm,
    Qwen,
}

impl ModelVariant {
    /// ChatGLM uses 2D position ids (`[position, block_position]`) instead
    /// of the standard 1D range; everything else follows the common path.
    pub fn prepare_context_position_ids(&self, context_length: usize) -> VariantExtraInputs {
        match self {
            ModelVariant::ChatGlm => {
                let position_ids: Vec<i32> = (0..context_length as i32).collect();
                let mut block_position_ids = vec![0i32; context_length];
                if context_length > 0 {
                    block_position_ids[context_length - 1] = 1;
                }
                VariantExtraInputs {
                    position_ids: Some(position_ids),
                    block_position_ids: Some(block_position_ids),
                    attention_mask: None,
                }
            }
            ModelVariant::Standard | ModelVariant::Qwen => VariantExtraInputs {
                position_ids: Some((0..context_length as i32).collect()),
                block_position_ids: None,
                attention_mask: None,
            },
        }
    }

    /// Generation-phase position id for `step` given a fixed `context_length`.
    /// ChatGLM's block position advances instead of the primary position past
    /// the context boundary; Qwen and Standard simply continue the range.
    pub fn generation_position_id(&self, context_length: usize, step: usize) -> (i32, Option<i32>) {
        match self {
            ModelVariant::ChatGlm => {
                let position = (context_length.saturating_sub(1)) as i32;
                let block_position = (step + 1) as i32;
                (position, Some(block_position))
            }
            ModelVariant::Standard | ModelVariant::Qwen => {
                ((context_length + step) as i32, None)
            }
        }
    }

    /// Whether this variant requires `remove_input_padding` to be enabled;
    /// Qwen's fused-attention path does not support padded batches.
    pub fn requires_remove_input_padding(&self) -> bool {
        matches!(self, ModelVariant::Qwen)
    }
}

impl Default for ModelVariant {
    fn default() -> Self {
        ModelVariant::Standard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_position_ids_are_a_plain_range() {
        let extra = ModelVariant::Standard.prepare_context_position_ids(5);
        assert_eq!(extra.position_ids, Some(vec![0, 1, 2, 3, 4]));
        assert!(extra.block_position_ids.is_none());
    }

    #[test]
    fn chatglm_context_marks_final_block_position() {
        let extra = ModelVariant::ChatGlm.prepare_context_position_ids(4);
        assert_eq!(extra.block_position_ids, Some(vec![0, 0, 0, 1]));
    }

    #[test]
    fn chatglm_generation_step_advances_block_position_only() {
        let (position, block) = ModelVariant::ChatGlm.generation_position_id(4, 2);
        assert_eq!(position, 3);
        assert_eq!(block, Some(3));
    }

    #[test]
    fn standard_generation_step_advances_position() {
        let (position, block) = ModelVariant::Standard.generation_position_id(4, 2);
        assert_eq!(position, 6);
        assert_eq!(block, None);
    }

    #[test]
    fn qwen_requires_remove_input_padding() {
        assert!(ModelVariant::Qwen.requires_remove_input_padding());
        assert!(!ModelVariant::Standard.requires_remove_input_padding());
    }
}
