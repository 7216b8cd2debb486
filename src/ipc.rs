//! IPC / custom all-reduce workspace: a shared buffer plus in/out barrier
//! regions across tensor-parallel ranks (§2 component table, §5).
//!
//! Grounded on the teacher's `Mapping`-aware sizing idiom (compute a buffer
//! size from topology fields, allocate once in `setup`) and on §5's
//! concurrency model describing the barrier handshake between ranks before
//! each custom all-reduce kernel launch.

use crate::backend::{DevicePtr, ExecutionBackend};
use crate::error::{Result, RuntimeError};
use crate::mapping::Mapping;
use std::sync::Arc;

/// Buffer size in bytes for the custom all-reduce workspace:
/// `B * K * L_ctx * hidden * tp_size * sizeof(f32)`, per the spec's sizing
/// formula.
pub fn workspace_buffer_bytes(
    batch_size: usize,
    beam_width: usize,
    max_ctx_length: usize,
    hidden_size: usize,
    tp_size: usize,
) -> usize {
    batch_size * beam_width * max_ctx_length * hidden_size * tp_size * std::mem::size_of::<f32>()
}

/// Two small fixed-size barrier regions (input and output) used by all tp
/// ranks to signal readiness before and after a custom all-reduce kernel.
const BARRIER_REGION_BYTES: usize = 128;

/// Shared IPC workspace: a data buffer plus a pair of barrier regions,
/// allocated once per tp group and reused across every all-reduce call.
pub struct IpcWorkspace {
    buffer: DevicePtr,
    buffer_bytes: usize,
    barrier_in: DevicePtr,
    barrier_out: DevicePtr,
    mapping: Mapping,
}

impl IpcWorkspace {
    /// Allocate the workspace via `backend`. Only meaningful when
    /// `mapping.tp_size > 1`; single-rank mappings should not construct one.
    pub fn new<B: ExecutionBackend>(
        backend: &Arc<B>,
        mapping: Mapping,
        batch_size: usize,
        beam_width: usize,
        max_ctx_length: usize,
        hidden_size: usize,
    ) -> Result<Self> {
        if mapping.tp_size <= 1 {
            return Err(RuntimeError::Configuration(
                "IPC workspace is only needed when tp_size > 1".to_string(),
            ));
        }
        let buffer_bytes =
            workspace_buffer_bytes(batch_size, beam_width, max_ctx_length, hidden_size, mapping.tp_size);
        let buffer = backend.alloc(buffer_bytes)?;
        let barrier_in = backend.alloc(BARRIER_REGION_BYTES)?;
        let barrier_out = backend.alloc(BARRIER_REGION_BYTES)?;

        Ok(Self {
            buffer,
            buffer_bytes,
            barrier_in,
            barrier_out,
            mapping,
        })
    }

    pub fn buffer(&self) -> DevicePtr {
        self.buffer
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    pub fn barrier_in(&self) -> DevicePtr {
        self.barrier_in
    }

    pub fn barrier_out(&self) -> DevicePtr {
        self.barrier_out
    }

    pub fn tp_size(&self) -> usize {
        self.mapping.tp_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FakeExecutionBackend;

    #[test]
    fn buffer_size_matches_spec_formula() {
        let bytes = workspace_buffer_bytes(2, 4, 128, 4096, 8);
        assert_eq!(bytes, 2 * 4 * 128 * 4096 * 8 * 4);
    }

    #[test]
    fn single_rank_mapping_is_rejected() {
        let backend = FakeExecutionBackend::new(vec![], 1);
        let mapping = Mapping::single_gpu();
        let err = IpcWorkspace::new(&backend, mapping, 1, 1, 128, 4096).unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration(_)));
    }

    #[test]
    fn multi_rank_mapping_allocates_distinct_regions() {
        let backend = FakeExecutionBackend::new(vec![], 1);
        let mapping = Mapping::new(0, 4, 4, 1, 8).unwrap();
        let ws = IpcWorkspace::new(&backend, mapping, 1, 1, 128, 4096).unwrap();
        assert_ne!(ws.buffer(), ws.barrier_in());
        assert_ne!(ws.barrier_in(), ws.barrier_out());
    }
}
