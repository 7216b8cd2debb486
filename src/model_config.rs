//! Immutable per-session model description
//!
//! Grounded on `original_source/tensorrt_llm/runtime/generation.py`'s
//! `ModelConfig` dataclass: field names, defaults, and the derived
//! `head_size` all carry over unchanged in meaning.

use serde::{Deserialize, Serialize};

/// KV-cache / activation quantization mode. The external engine decides what
/// this actually lowers to; the session only needs to know whether KV-cache
/// quantization is active (affects present-key-value buffer dtype sizing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuantMode {
    #[default]
    None,
    Int8Weights,
    Int4Weights,
    KvCacheInt8,
    KvCacheFp8,
}

impl QuantMode {
    pub fn has_kv_cache_quant(self) -> bool {
        matches!(self, Self::KvCacheInt8 | Self::KvCacheFp8)
    }
}

/// Immutable description of the compiled model the engine implements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub vocab_size_padded: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub hidden_size: usize,
    head_size: Option<usize>,

    pub model_name: String,
    pub dtype: String,

    pub gpt_attention_plugin: bool,
    pub remove_input_padding: bool,
    pub paged_kv_cache: bool,
    pub cross_attention: bool,
    pub has_position_embedding: bool,
    pub has_token_type_embedding: bool,
    pub gather_all_token_logits: bool,
    pub use_custom_all_reduce: bool,

    pub tokens_per_block: usize,
    pub max_prompt_embedding_table_size: usize,
    pub quant_mode: QuantMode,

    pub lora_plugin: bool,
    pub lora_target_modules: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 0,
            vocab_size_padded: 0,
            num_layers: 0,
            num_heads: 0,
            num_kv_heads: 0,
            hidden_size: 0,
            head_size: None,
            model_name: String::new(),
            dtype: String::new(),
            gpt_attention_plugin: false,
            remove_input_padding: false,
            paged_kv_cache: false,
            cross_attention: false,
            has_position_embedding: true,
            has_token_type_embedding: false,
            gather_all_token_logits: false,
            use_custom_all_reduce: false,
            tokens_per_block: 64,
            max_prompt_embedding_table_size: 0,
            quant_mode: QuantMode::None,
            lora_plugin: false,
            lora_target_modules: Vec::new(),
        }
    }
}

impl ModelConfig {
    pub fn new(vocab_size: usize, num_layers: usize, num_heads: usize, hidden_size: usize) -> Self {
        Self {
            vocab_size,
            vocab_size_padded: vocab_size,
            num_layers,
            num_heads,
            num_kv_heads: num_heads,
            hidden_size,
            ..Default::default()
        }
    }

    pub fn with_kv_heads(mut self, num_kv_heads: usize) -> Self {
        self.num_kv_heads = num_kv_heads;
        self
    }

    pub fn with_paged_kv_cache(mut self, tokens_per_block: usize) -> Self {
        self.paged_kv_cache = true;
        self.tokens_per_block = tokens_per_block;
        self
    }

    pub fn with_gpt_attention_plugin(mut self, enabled: bool) -> Self {
        self.gpt_attention_plugin = enabled;
        self
    }

    pub fn with_lora(mut self, target_modules: Vec<String>) -> Self {
        self.lora_plugin = true;
        self.lora_target_modules = target_modules;
        self
    }

    /// `head_size`, derived as `hidden_size / num_heads` when not set explicitly.
    pub fn head_size(&self) -> usize {
        self.head_size.unwrap_or_else(|| {
            if self.num_heads == 0 {
                0
            } else {
                self.hidden_size / self.num_heads
            }
        })
    }

    pub fn with_head_size(mut self, head_size: usize) -> Self {
        self.head_size = Some(head_size);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_head_size_when_unset() {
        let cfg = ModelConfig::new(32000, 32, 32, 4096);
        assert_eq!(cfg.head_size(), 128);
    }

    #[test]
    fn explicit_head_size_wins() {
        let cfg = ModelConfig::new(32000, 32, 32, 4096).with_head_size(64);
        assert_eq!(cfg.head_size(), 64);
    }

    #[test]
    fn defaults_match_original_dataclass() {
        let cfg = ModelConfig::default();
        assert!(!cfg.paged_kv_cache);
        assert!(cfg.has_position_embedding);
        assert!(!cfg.has_token_type_embedding);
        assert_eq!(cfg.tokens_per_block, 64);
    }
}
