//! KV cache manager: paged block pool and contiguous per-layer modes
//!
//! Grounded on the teacher's `inference/kv_cache.rs` for the allocation/
//! eviction bookkeeping idiom (plain structs tracked in a `HashMap`, an
//! explicit `CachePoolStats` snapshot type) and on §4.2 / §9 of the spec for
//! the block-pointer-array semantics themselves, which the teacher's
//! llama.cpp-backed cache does not need (llama.cpp owns its own KV cache).

use crate::backend::DevicePtr;
use crate::error::{Result, RuntimeError};
use std::collections::HashMap;

/// A single sequence tracked by the paged KV-cache manager: a sequence
/// index, the batch index it belongs to, its current token count, and the
/// ordered list of block indices it owns.
#[derive(Debug, Clone)]
pub struct GenerationSequence {
    pub seq_index: usize,
    pub batch_index: usize,
    pub token_count: usize,
    pub blocks: Vec<usize>,
}

/// Paged block pool: one contiguous device tensor per local layer,
/// interpreted as `[num_blocks, 2, num_kv_heads, tokens_per_block, head_size]`.
pub struct PagedKvCacheManager {
    tokens_per_block: usize,
    num_local_layers: usize,
    layer_pool_ptrs: Vec<DevicePtr>,
    total_blocks: usize,
    free_blocks: Vec<usize>,
    sequences: HashMap<usize, GenerationSequence>,
}

impl PagedKvCacheManager {
    pub fn new(
        tokens_per_block: usize,
        num_local_layers: usize,
        layer_pool_ptrs: Vec<DevicePtr>,
        total_blocks: usize,
    ) -> Self {
        Self {
            tokens_per_block,
            num_local_layers,
            layer_pool_ptrs,
            total_blocks,
            free_blocks: (0..total_blocks).rev().collect(),
            sequences: HashMap::new(),
        }
    }

    fn blocks_needed(&self, token_count: usize) -> usize {
        token_count.div_ceil(self.tokens_per_block).max(1)
    }

    fn allocate_blocks(&mut self, count: usize) -> Result<Vec<usize>> {
        if self.free_blocks.len() < count {
            return Err(RuntimeError::Resource(format!(
                "paged KV cache exhausted: need {count} blocks, {} free",
                self.free_blocks.len()
            )));
        }
        Ok((0..count).map(|_| self.free_blocks.pop().unwrap()).collect())
    }

    /// Register a new sequence at context length `context_len`, assigning
    /// `ceil(context_len / tokens_per_block)` blocks.
    pub fn add_sequence(&mut self, seq_index: usize, batch_index: usize, context_len: usize) -> Result<()> {
        let needed = self.blocks_needed(context_len);
        let blocks = self.allocate_blocks(needed)?;
        self.sequences.insert(
            seq_index,
            GenerationSequence {
                seq_index,
                batch_index,
                token_count: context_len,
                blocks,
            },
        );
        Ok(())
    }

    /// Advance every tracked sequence by one token, or free it if
    /// `should_free[batch_index]` is set. Allocates one additional block per
    /// sequence whenever the new token count crosses a block boundary.
    pub fn step(&mut self, should_free: &[bool]) -> Result<()> {
        let mut to_free = Vec::new();
        let mut growth: Vec<(usize, usize)> = Vec::new();

        for (seq_index, seq) in self.sequences.iter() {
            let free = should_free.get(seq.batch_index).copied().unwrap_or(false);
            if free {
                to_free.push(*seq_index);
                continue;
            }
            let new_count = seq.token_count + 1;
            let crosses_boundary = new_count > seq.blocks.len() * self.tokens_per_block;
            if crosses_boundary {
                growth.push((*seq_index, 1));
            }
        }

        for seq_index in to_free {
            if let Some(seq) = self.sequences.remove(&seq_index) {
                self.free_blocks.extend(seq.blocks);
            }
        }

        for (seq_index, extra) in growth {
            let new_block = self.allocate_blocks(extra)?;
            if let Some(seq) = self.sequences.get_mut(&seq_index) {
                seq.blocks.extend(new_block);
            }
        }

        for seq in self.sequences.values_mut() {
            seq.token_count += 1;
        }

        Ok(())
    }

    pub fn max_blocks_per_seq(&self) -> usize {
        self.sequences.values().map(|s| s.blocks.len()).max().unwrap_or(0)
    }

    /// Per local layer, a host tensor of shape `[B, K, 2, max_blocks_per_seq]`
    /// holding device addresses of each block for each beam. Beams within a
    /// batch entry share physical blocks; divergence is tracked by
    /// `cache_indirection`, not by copying blocks here.
    pub fn get_pointer_arrays(&self, batch_size: usize, beam_width: usize) -> Vec<Vec<DevicePtr>> {
        let max_blocks = self.max_blocks_per_seq();
        let mut per_layer = Vec::with_capacity(self.num_local_layers);

        for layer in 0..self.num_local_layers {
            let base = self.layer_pool_ptrs[layer].0;
            let mut flat = vec![DevicePtr(0); batch_size * beam_width * 2 * max_blocks];

            for seq in self.sequences.values() {
                if seq.batch_index >= batch_size {
                    continue;
                }
                for k in 0..beam_width {
                    for (block_slot, &block_idx) in seq.blocks.iter().enumerate() {
                        for kv in 0..2 {
                            let offset = (((seq.batch_index * beam_width + k) * 2 + kv) * max_blocks) + block_slot;
                            flat[offset] = DevicePtr(base + (block_idx as u64 * 2 + kv as u64));
                        }
                    }
                }
            }
            per_layer.push(flat);
        }
        per_layer
    }

    pub fn live_block_count(&self) -> usize {
        self.total_blocks - self.free_blocks.len()
    }

    pub fn sequence(&self, seq_index: usize) -> Option<&GenerationSequence> {
        self.sequences.get(&seq_index)
    }
}

/// Contiguous per-layer cache: one tensor per layer of shape
/// `[B, 2, H_kv, W, D_head]`. When the fused-attention-plugin is not used,
/// a mirror buffer ping-pongs input/output roles across steps.
pub struct ContiguousKvCacheManager {
    num_local_layers: usize,
    primary: Vec<DevicePtr>,
    mirror: Option<Vec<DevicePtr>>,
}

impl ContiguousKvCacheManager {
    pub fn new(num_local_layers: usize, primary: Vec<DevicePtr>, mirror: Option<Vec<DevicePtr>>) -> Result<Self> {
        if primary.len() != num_local_layers {
            return Err(RuntimeError::Configuration(format!(
                "expected {num_local_layers} primary KV buffers, got {}",
                primary.len()
            )));
        }
        if let Some(m) = &mirror {
            if m.len() != num_local_layers {
                return Err(RuntimeError::Configuration(format!(
                    "expected {num_local_layers} mirror KV buffers, got {}",
                    m.len()
                )));
            }
        }
        Ok(Self {
            num_local_layers,
            primary,
            mirror,
        })
    }

    /// `(input, output)` buffer pointers for layer `layer` at `step`. Without
    /// a fused-attention-plugin mirror buffer, both input and output are the
    /// single primary buffer (the engine performs attention in place).
    pub fn buffers_for_step(&self, layer: usize, step: u64) -> (DevicePtr, DevicePtr) {
        match &self.mirror {
            None => (self.primary[layer], self.primary[layer]),
            Some(mirror) => {
                if step % 2 == 0 {
                    (self.primary[layer], mirror[layer])
                } else {
                    (mirror[layer], self.primary[layer])
                }
            }
        }
    }

    pub fn num_local_layers(&self) -> usize {
        self.num_local_layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer_ptrs(n: usize) -> Vec<DevicePtr> {
        (0..n).map(|i| DevicePtr(1000 + i as u64)).collect()
    }

    #[test]
    fn paged_initial_allocation_matches_spec_scenario() {
        // scenario 3: tokens_per_block=8, context=17 -> ceil(17/8) = 3 blocks.
        let mut mgr = PagedKvCacheManager::new(8, 2, layer_ptrs(2), 64);
        mgr.add_sequence(0, 0, 17).unwrap();
        assert_eq!(mgr.sequence(0).unwrap().blocks.len(), 3);
    }

    #[test]
    fn paged_grows_across_block_boundary_over_steps() {
        let mut mgr = PagedKvCacheManager::new(8, 2, layer_ptrs(2), 64);
        mgr.add_sequence(0, 0, 17).unwrap();
        for _ in 0..15 {
            mgr.step(&[false]).unwrap();
        }
        // 17 + 15 = 32 tokens -> ceil(32/8) = 4 blocks.
        assert_eq!(mgr.sequence(0).unwrap().blocks.len(), 4);
    }

    #[test]
    fn paged_step_frees_sequence_and_recycles_blocks() {
        let mut mgr = PagedKvCacheManager::new(4, 1, layer_ptrs(1), 8);
        mgr.add_sequence(0, 0, 4).unwrap();
        let live_before = mgr.live_block_count();
        assert!(live_before > 0);
        mgr.step(&[true]).unwrap();
        assert_eq!(mgr.live_block_count(), 0);
        assert!(mgr.sequence(0).is_none());
    }

    #[test]
    fn paged_allocation_failure_is_resource_error() {
        let mut mgr = PagedKvCacheManager::new(8, 1, layer_ptrs(1), 2);
        let err = mgr.add_sequence(0, 0, 100).unwrap_err();
        assert!(matches!(err, RuntimeError::Resource(_)));
    }

    #[test]
    fn contiguous_without_mirror_reuses_same_buffer() {
        let mgr = ContiguousKvCacheManager::new(2, layer_ptrs(2), None).unwrap();
        let (i, o) = mgr.buffers_for_step(0, 3);
        assert_eq!(i, o);
    }

    #[test]
    fn contiguous_with_mirror_swaps_roles_by_parity() {
        let primary = layer_ptrs(1);
        let mirror = vec![DevicePtr(9999)];
        let mgr = ContiguousKvCacheManager::new(1, primary.clone(), Some(mirror.clone())).unwrap();
        let (i0, o0) = mgr.buffers_for_step(0, 0);
        let (i1, o1) = mgr.buffers_for_step(0, 1);
        assert_eq!((i0, o0), (primary[0], mirror[0]));
        assert_eq!((i1, o1), (mirror[0], primary[0]));
    }
}
