//! Runtime wrapper: engine ownership, execution-context ping-pong, and the
//! CUDA-graph fast path.
//!
//! Grounded on `original_source`'s `class _Runtime`: the one-profile vs.
//! two-profile context-creation branch is carried over exactly, including
//! the canonical resolution of Open Question (i) in the spec's design
//! notes — `ctx_context` is the step-0 context, alternation between
//! `context_0`/`context_1` begins at step 1.

use crate::backend::{ContextHandle, EngineHandle, ExecutionBackend, GraphExecHandle, StreamHandle};
use crate::error::{Result, RuntimeError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Execution contexts available on the runtime, named the way the prose
/// contract names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextSlot {
    /// The context-phase profile, used at step 0 and canonical per the
    /// resolved Open Question (i).
    CtxContext,
    Context0,
    Context1,
}

/// Owns the engine, its execution contexts, and (when enabled) the
/// CUDA-graph instance cache for the generation fast path.
pub struct Runtime<B: ExecutionBackend> {
    backend: Arc<B>,
    engine: EngineHandle,
    contexts: HashMap<ContextSlot, ContextHandle>,
    stream: StreamHandle,
    graph_mode: bool,
    graphs: HashMap<ContextSlot, GraphExecHandle>,
}

impl<B: ExecutionBackend> Runtime<B> {
    /// Deserialize `engine_bytes` and create execution contexts per the
    /// one-profile/two-profile branch in §4.1.
    pub fn new(backend: Arc<B>, engine_bytes: &[u8], stream: StreamHandle, graph_mode: bool) -> Result<Self> {
        let engine = backend.load_engine(engine_bytes)?;
        let profiles = backend.num_optimization_profiles(engine)?;

        let mut contexts = HashMap::new();
        match profiles {
            1 => {
                let context_0 = backend.create_context(engine, 0)?;
                let context_1 = backend.create_context(engine, 0)?;
                contexts.insert(ContextSlot::Context0, context_0);
                contexts.insert(ContextSlot::Context1, context_1);
                // ctx_context aliases context_1 under the one-profile branch.
                contexts.insert(ContextSlot::CtxContext, context_1);
                debug!("runtime: single-profile engine, ctx_context aliases context_1");
            }
            2 => {
                let ctx_context = backend.create_context(engine, 0)?;
                let context_0 = backend.create_context(engine, 1)?;
                let context_1 = backend.create_context(engine, 1)?;
                contexts.insert(ContextSlot::CtxContext, ctx_context);
                contexts.insert(ContextSlot::Context0, context_0);
                contexts.insert(ContextSlot::Context1, context_1);
                debug!("runtime: two-profile engine, ctx_context is a distinct profile-0 context");
            }
            n => {
                return Err(RuntimeError::Configuration(format!(
                    "engine declares {n} optimization profiles; only 1 or 2 are supported"
                )));
            }
        }

        Ok(Self {
            backend,
            engine,
            contexts,
            stream,
            graph_mode,
            graphs: HashMap::new(),
        })
    }

    pub fn engine(&self) -> EngineHandle {
        self.engine
    }

    pub fn tensor_names(&self) -> Result<Vec<String>> {
        self.backend.tensor_names(self.engine)
    }

    pub fn graph_mode(&self) -> bool {
        self.graph_mode
    }

    /// Resolve which context slot step `step` should use. Step 0 always
    /// uses `CtxContext`; alternation begins at step 1 (odd -> Context0,
    /// even -> Context1), per the resolved Open Question (i).
    pub fn slot_for_step(step: u64) -> ContextSlot {
        if step == 0 {
            ContextSlot::CtxContext
        } else if step % 2 == 1 {
            ContextSlot::Context0
        } else {
            ContextSlot::Context1
        }
    }

    pub fn context(&self, slot: ContextSlot) -> ContextHandle {
        *self.contexts.get(&slot).expect("all context slots are populated in Runtime::new")
    }

    pub fn set_shape(&self, slot: ContextSlot, name: &str, shape: &[usize]) -> Result<()> {
        self.backend.set_shape(self.context(slot), name, shape)
    }

    pub fn set_buffer(&self, slot: ContextSlot, name: &str, ptr: crate::backend::DevicePtr) -> Result<()> {
        self.backend.set_buffer(self.context(slot), name, ptr)
    }

    /// Launch `slot` on this runtime's stream. Returns an error (not just a
    /// `false`) on a backend-reported launch failure, since a launch
    /// failure is fatal to the session per §7.
    pub fn run(&self, slot: ContextSlot, launched_tensors: &[String]) -> Result<()> {
        let ok = self.backend.execute_async(self.context(slot), self.stream)?;
        if !ok {
            return Err(RuntimeError::Launch {
                tensors: launched_tensors.to_vec(),
            });
        }
        Ok(())
    }

    pub fn synchronize_if_debug(&self, debug_mode: bool) -> Result<()> {
        if debug_mode {
            self.backend.synchronize(self.stream)?;
        }
        Ok(())
    }

    /// Context phase always clears graph instances: its shapes differ from
    /// the generation phase and are not graphable.
    pub fn clear_graphs(&mut self) -> Result<()> {
        for (_, graph) in self.graphs.drain() {
            self.backend.destroy_graph(graph)?;
        }
        Ok(())
    }

    /// CUDA-graph fast path for the generation phase: capture + instantiate,
    /// or update the existing instance in place; destroy and re-instantiate
    /// on update failure.
    pub fn capture_or_update_graph(&mut self, slot: ContextSlot) -> Result<()> {
        if !self.graph_mode {
            return Ok(());
        }
        let ctx = self.context(slot);
        if let Some(existing) = self.graphs.get(&slot).copied() {
            match self.backend.try_update_graph(existing, ctx) {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    warn!(?slot, "graph update failed, destroying and re-instantiating");
                    self.backend.destroy_graph(existing)?;
                    self.graphs.remove(&slot);
                }
            }
        }
        let graph = self.backend.capture_and_instantiate(ctx, self.stream)?;
        self.graphs.insert(slot, graph);
        Ok(())
    }

    pub fn launch_graph(&self, slot: ContextSlot) -> Result<()> {
        let graph = *self
            .graphs
            .get(&slot)
            .ok_or_else(|| RuntimeError::Resource("no graph instance captured for this slot".to_string()))?;
        let ok = self.backend.launch_graph(graph, self.stream)?;
        if !ok {
            return Err(RuntimeError::Launch { tensors: vec![] });
        }
        Ok(())
    }

    pub fn destroy(&mut self) -> Result<()> {
        self.clear_graphs()?;
        for (_, ctx) in self.contexts.drain() {
            self.backend.destroy_context(ctx)?;
        }
        Ok(())
    }
}

impl<B: ExecutionBackend> Drop for Runtime<B> {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!("error tearing down runtime: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FakeExecutionBackend;

    #[test]
    fn single_profile_aliases_ctx_context_to_context_1() {
        let backend = FakeExecutionBackend::new(vec![], 1);
        let rt = Runtime::new(backend, &[], StreamHandle(0), false).unwrap();
        assert_eq!(rt.context(ContextSlot::CtxContext), rt.context(ContextSlot::Context1));
    }

    #[test]
    fn two_profile_ctx_context_is_distinct() {
        let backend = FakeExecutionBackend::new(vec![], 2);
        let rt = Runtime::new(backend, &[], StreamHandle(0), false).unwrap();
        assert_ne!(rt.context(ContextSlot::CtxContext), rt.context(ContextSlot::Context0));
        assert_ne!(rt.context(ContextSlot::CtxContext), rt.context(ContextSlot::Context1));
    }

    #[test]
    fn rejects_more_than_two_profiles() {
        let backend = FakeExecutionBackend::new(vec![], 3);
        assert!(Runtime::new(backend, &[], StreamHandle(0), false).is_err());
    }

    #[test]
    fn step_zero_uses_ctx_context_then_alternates_from_step_one() {
        assert_eq!(Runtime::<FakeExecutionBackend>::slot_for_step(0), ContextSlot::CtxContext);
        assert_eq!(Runtime::<FakeExecutionBackend>::slot_for_step(1), ContextSlot::Context0);
        assert_eq!(Runtime::<FakeExecutionBackend>::slot_for_step(2), ContextSlot::Context1);
        assert_eq!(Runtime::<FakeExecutionBackend>::slot_for_step(3), ContextSlot::Context0);
    }
}
