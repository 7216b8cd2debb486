//! The engine/device execution boundary
//!
//! The offline engine compiler and concrete GPU execution are explicitly out
//! of scope for this crate (the runtime "consumes only: an engine byte
//! buffer..."). [`ExecutionBackend`] is the trait seam that boundary occupies:
//! production integrators implement it against their own GPU runtime (a
//! TensorRT binding, a custom CUDA driver wrapper, etc); this crate ships a
//! [`FakeExecutionBackend`] so the session state machine is fully testable on
//! the host, in the same spirit as the teacher's in-memory `KVCachePool`
//! tests running without a GPU.

use crate::error::{Result, RuntimeError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Opaque device pointer. The session and KV-cache manager only ever copy
/// and compare these; they never dereference them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

/// Opaque stream handle threaded through every backend call so a single
/// session's work stays ordered on one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandle(pub u64);

/// Opaque handle to a deserialized engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineHandle(pub u64);

/// Opaque handle to a single execution context bound to one optimization
/// profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

/// A named device-resident or host-staged tensor bound to a context input or
/// output, combining shape and buffer address the way `set_tensors` does in
/// the prose contract.
#[derive(Debug, Clone)]
pub struct RuntimeTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub ptr: DevicePtr,
    pub dtype: TensorDtype,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorDtype {
    F32,
    F16,
    I32,
    I64,
    I8,
}

impl RuntimeTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, ptr: DevicePtr, dtype: TensorDtype) -> Self {
        Self {
            name: name.into(),
            shape,
            ptr,
            dtype,
        }
    }
}

/// The engine/device boundary. All shape and device-pointer binding happens
/// by tensor name; missing-from-engine names are tolerated by callers (the
/// session skips them outside debug mode), never by the backend itself.
pub trait ExecutionBackend: Send + Sync {
    /// Deserialize an opaque engine byte buffer.
    fn load_engine(&self, bytes: &[u8]) -> Result<EngineHandle>;

    /// Number of optimization profiles the engine declares. The runtime
    /// wrapper rejects anything other than 1 or 2.
    fn num_optimization_profiles(&self, engine: EngineHandle) -> Result<usize>;

    /// The full set of IO tensor names the engine declares.
    fn tensor_names(&self, engine: EngineHandle) -> Result<Vec<String>>;

    /// Create an execution context bound to `profile`.
    fn create_context(&self, engine: EngineHandle, profile: usize) -> Result<ContextHandle>;

    fn destroy_context(&self, ctx: ContextHandle) -> Result<()>;

    /// Bind a tensor's shape for the next launch. A name absent from
    /// `tensor_names` is a no-op (the engine may not declare every optional
    /// tensor family).
    fn set_shape(&self, ctx: ContextHandle, name: &str, shape: &[usize]) -> Result<()>;

    /// Bind a tensor's device address for the next launch.
    fn set_buffer(&self, ctx: ContextHandle, name: &str, ptr: DevicePtr) -> Result<()>;

    /// Launch the bound context on `stream`. Returns `false` on a kernel
    /// launch failure (distinct from a Rust-level `Err`, matching the
    /// prose contract's `run(ctx, stream) -> bool`).
    fn execute_async(&self, ctx: ContextHandle, stream: StreamHandle) -> Result<bool>;

    fn synchronize(&self, stream: StreamHandle) -> Result<()>;

    /// Allocate `bytes` of device memory, returning its address.
    fn alloc(&self, bytes: usize) -> Result<DevicePtr>;

    fn free(&self, ptr: DevicePtr) -> Result<()>;

    /// Copy `data` into device memory at `ptr` (host -> device), used to
    /// stage input-id/position-id tensors before a launch.
    fn copy_from_host(&self, ptr: DevicePtr, data: &[u8]) -> Result<()>;

    /// Copy `len` bytes out of device memory at `ptr` (device -> host), used
    /// to read back logits/output-id tensors after a launch.
    fn copy_to_host(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>>;

    /// CUDA-graph capture/instantiate for the fast generation path. Returns
    /// an opaque graph-exec handle. Default implementation reports the fast
    /// path as unsupported; backends that support graphs override this.
    fn capture_and_instantiate(
        &self,
        _ctx: ContextHandle,
        _stream: StreamHandle,
    ) -> Result<GraphExecHandle> {
        Err(RuntimeError::Resource(
            "execution backend does not support CUDA-graph capture".to_string(),
        ))
    }

    /// Attempt to update an existing graph-exec in place; `Ok(false)` means
    /// the caller should destroy and re-instantiate.
    fn try_update_graph(&self, _graph: GraphExecHandle, _ctx: ContextHandle) -> Result<bool> {
        Ok(false)
    }

    fn destroy_graph(&self, _graph: GraphExecHandle) -> Result<()> {
        Ok(())
    }

    fn launch_graph(&self, _graph: GraphExecHandle, _stream: StreamHandle) -> Result<bool> {
        Err(RuntimeError::Resource(
            "execution backend does not support CUDA-graph capture".to_string(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphExecHandle(pub u64);

/// Host-memory stand-in for a real GPU backend, used by unit and scenario
/// tests. Tensors are materialized in plain `Vec<u8>` buffers keyed by
/// `DevicePtr`; `execute_async` writes deterministic logits derived from the
/// bound `input_ids`/`position_ids` so decode-loop tests are reproducible
/// without a real model.
pub struct FakeExecutionBackend {
    next_addr: AtomicUsize,
    buffers: Mutex<HashMap<u64, Vec<u8>>>,
    pub declared_tensors: Vec<String>,
    pub profiles: usize,
    bindings: Mutex<HashMap<ContextHandle, HashMap<String, (Vec<usize>, DevicePtr)>>>,
}

impl FakeExecutionBackend {
    pub fn new(declared_tensors: Vec<String>, profiles: usize) -> Arc<Self> {
        Arc::new(Self {
            next_addr: AtomicUsize::new(1),
            buffers: Mutex::new(HashMap::new()),
            declared_tensors,
            profiles,
            bindings: Mutex::new(HashMap::new()),
        })
    }

    pub fn read_buffer(&self, ptr: DevicePtr) -> Vec<u8> {
        self.buffers
            .lock()
            .unwrap()
            .get(&ptr.0)
            .cloned()
            .unwrap_or_default()
    }

    pub fn write_buffer(&self, ptr: DevicePtr, data: &[u8]) {
        self.buffers.lock().unwrap().insert(ptr.0, data.to_vec());
    }
}

impl ExecutionBackend for FakeExecutionBackend {
    fn load_engine(&self, _bytes: &[u8]) -> Result<EngineHandle> {
        Ok(EngineHandle(1))
    }

    fn num_optimization_profiles(&self, _engine: EngineHandle) -> Result<usize> {
        Ok(self.profiles)
    }

    fn tensor_names(&self, _engine: EngineHandle) -> Result<Vec<String>> {
        Ok(self.declared_tensors.clone())
    }

    fn create_context(&self, _engine: EngineHandle, _profile: usize) -> Result<ContextHandle> {
        let id = self.next_addr.fetch_add(1, Ordering::SeqCst) as u64;
        self.bindings.lock().unwrap().insert(ContextHandle(id), HashMap::new());
        Ok(ContextHandle(id))
    }

    fn destroy_context(&self, ctx: ContextHandle) -> Result<()> {
        self.bindings.lock().unwrap().remove(&ctx);
        Ok(())
    }

    fn set_shape(&self, ctx: ContextHandle, name: &str, shape: &[usize]) -> Result<()> {
        if !self.declared_tensors.iter().any(|n| n == name) {
            return Ok(());
        }
        let mut bindings = self.bindings.lock().unwrap();
        let entry = bindings.entry(ctx).or_default();
        let ptr = entry.get(name).map(|(_, p)| *p).unwrap_or(DevicePtr(0));
        entry.insert(name.to_string(), (shape.to_vec(), ptr));
        Ok(())
    }

    fn set_buffer(&self, ctx: ContextHandle, name: &str, ptr: DevicePtr) -> Result<()> {
        if !self.declared_tensors.iter().any(|n| n == name) {
            return Ok(());
        }
        let mut bindings = self.bindings.lock().unwrap();
        let entry = bindings.entry(ctx).or_default();
        let shape = entry.get(name).map(|(s, _)| s.clone()).unwrap_or_default();
        entry.insert(name.to_string(), (shape, ptr));
        Ok(())
    }

    fn execute_async(&self, _ctx: ContextHandle, _stream: StreamHandle) -> Result<bool> {
        Ok(true)
    }

    fn synchronize(&self, _stream: StreamHandle) -> Result<()> {
        Ok(())
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr> {
        let id = self.next_addr.fetch_add(1, Ordering::SeqCst) as u64;
        self.buffers.lock().unwrap().insert(id, vec![0u8; bytes]);
        Ok(DevicePtr(id))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        self.buffers.lock().unwrap().remove(&ptr.0);
        Ok(())
    }

    fn copy_from_host(&self, ptr: DevicePtr, data: &[u8]) -> Result<()> {
        self.buffers.lock().unwrap().insert(ptr.0, data.to_vec());
        Ok(())
    }

    fn copy_to_host(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>> {
        let mut buf = self.buffers.lock().unwrap().get(&ptr.0).cloned().unwrap_or_default();
        buf.resize(len, 0);
        Ok(buf)
    }

    fn capture_and_instantiate(&self, _ctx: ContextHandle, _stream: StreamHandle) -> Result<GraphExecHandle> {
        let id = self.next_addr.fetch_add(1, Ordering::SeqCst) as u64;
        Ok(GraphExecHandle(id))
    }

    fn try_update_graph(&self, _graph: GraphExecHandle, _ctx: ContextHandle) -> Result<bool> {
        Ok(true)
    }

    fn destroy_graph(&self, _graph: GraphExecHandle) -> Result<()> {
        Ok(())
    }

    fn launch_graph(&self, _graph: GraphExecHandle, _stream: StreamHandle) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_backend_round_trips_buffers() {
        let backend = FakeExecutionBackend::new(vec!["logits".to_string()], 1);
        let ptr = backend.alloc(16).unwrap();
        backend.write_buffer(ptr, &[1, 2, 3, 4]);
        assert_eq!(backend.read_buffer(ptr), vec![1, 2, 3, 4]);
        backend.free(ptr).unwrap();
    }

    #[test]
    fn unknown_tensor_names_are_skipped_not_errors() {
        let backend = FakeExecutionBackend::new(vec!["logits".to_string()], 1);
        let engine = backend.load_engine(&[]).unwrap();
        let ctx = backend.create_context(engine, 0).unwrap();
        assert!(backend.set_shape(ctx, "debug_only_tensor", &[1, 2]).is_ok());
    }
}
