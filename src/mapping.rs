//! Tensor/pipeline-parallel topology descriptor

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};

/// Describes this rank's position in a tensor/pipeline-parallel topology.
///
/// Invariant: `num_layers % pp_size == 0`; each rank owns layers
/// `[first_layer, last_layer)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    pub rank: usize,
    pub world_size: usize,
    pub tp_size: usize,
    pub pp_size: usize,
    pub gpus_per_node: usize,
    pub pp_group: Vec<usize>,
}

impl Mapping {
    pub fn single_gpu() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            tp_size: 1,
            pp_size: 1,
            gpus_per_node: 1,
            pp_group: vec![0],
        }
    }

    pub fn new(
        rank: usize,
        world_size: usize,
        tp_size: usize,
        pp_size: usize,
        gpus_per_node: usize,
    ) -> Result<Self> {
        if tp_size * pp_size != world_size {
            return Err(RuntimeError::Configuration(format!(
                "tp_size ({tp_size}) * pp_size ({pp_size}) must equal world_size ({world_size})"
            )));
        }
        let pp_rank = rank / tp_size;
        let tp_rank = rank % tp_size;
        let pp_group = (0..pp_size).map(|p| p * tp_size + tp_rank).collect();
        let _ = pp_rank;
        Ok(Self {
            rank,
            world_size,
            tp_size,
            pp_size,
            gpus_per_node,
            pp_group,
        })
    }

    pub fn pp_rank(&self) -> usize {
        self.rank / self.tp_size
    }

    pub fn is_first_pp_rank(&self) -> bool {
        self.pp_rank() == 0
    }

    pub fn is_last_pp_rank(&self) -> bool {
        self.pp_rank() == self.pp_size - 1
    }

    pub fn has_pp(&self) -> bool {
        self.pp_size > 1
    }

    /// Validate `num_layers % pp_size == 0` and return this rank's
    /// `[first_layer, last_layer)` half-open range.
    pub fn layer_range(&self, num_layers: usize) -> Result<(usize, usize)> {
        if num_layers % self.pp_size != 0 {
            return Err(RuntimeError::Configuration(format!(
                "num_layers ({num_layers}) is not divisible by pp_size ({})",
                self.pp_size
            )));
        }
        let per_rank = num_layers / self.pp_size;
        let first = self.pp_rank() * per_rank;
        Ok((first, first + per_rank))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_gpu_is_first_and_last() {
        let m = Mapping::single_gpu();
        assert!(m.is_first_pp_rank());
        assert!(m.is_last_pp_rank());
        assert!(!m.has_pp());
    }

    #[test]
    fn rejects_inconsistent_world_size() {
        assert!(Mapping::new(0, 4, 2, 3, 8).is_err());
    }

    #[test]
    fn layer_range_splits_evenly() {
        let m = Mapping::new(2, 4, 2, 2, 8).unwrap();
        assert_eq!(m.layer_range(32).unwrap(), (16, 32));
    }

    #[test]
    fn rejects_uneven_layer_split() {
        let m = Mapping::new(0, 2, 1, 2, 8).unwrap();
        assert!(m.layer_range(31).is_err());
    }
}
