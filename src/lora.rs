//! LoRA adapter binder: per-layer, per-module rank/weight-pointer tables
//! keyed by a per-request UID (§4.6).
//!
//! Grounded on `original_source`'s `LoraManager`/`LoraCache` weight-pointer
//! table construction, and on the teacher's `model/loader.rs` pattern of a
//! small registry struct keyed by string ids with a `HashMap` lookup.

use crate::backend::DevicePtr;
use crate::error::{Result, RuntimeError};
use std::collections::HashMap;

/// The well-known UID meaning "no adapter"; resolves to rank 0 everywhere.
pub const NULL_UID: &str = "-1";

/// One module's weights for one layer of one adapter: an in/out projection
/// pair plus the adapter's rank for that module.
#[derive(Debug, Clone, Copy)]
pub struct LoraWeights {
    pub rank: usize,
    pub in_ptr: DevicePtr,
    pub out_ptr: DevicePtr,
}

/// A fully registered adapter: per-layer, per-module weight tables.
#[derive(Debug, Clone, Default)]
pub struct LoraAdapter {
    // keyed by (layer_index, module_name)
    modules: HashMap<(usize, String), LoraWeights>,
}

impl LoraAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_module(&mut self, layer: usize, module: &str, weights: LoraWeights) {
        self.modules.insert((layer, module.to_string()), weights);
    }

    pub fn module(&self, layer: usize, module: &str) -> Option<&LoraWeights> {
        self.modules.get(&(layer, module.to_string()))
    }
}

/// Registry of adapters keyed by request UID, plus the per-request UID
/// assignment table built each `setup()`.
#[derive(Default)]
pub struct LoraBinder {
    adapters: HashMap<String, LoraAdapter>,
    assigned: Vec<String>,
}

impl LoraBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, uid: &str, adapter: LoraAdapter) -> Result<()> {
        if uid == NULL_UID {
            return Err(RuntimeError::Configuration(
                "cannot register an adapter under the null UID \"-1\"".to_string(),
            ));
        }
        self.adapters.insert(uid.to_string(), adapter);
        Ok(())
    }

    /// Assign one UID per request in the batch. Missing/unregistered UIDs
    /// other than the null UID are a configuration error: the engine has no
    /// weights to bind.
    pub fn setup(&mut self, request_uids: &[String]) -> Result<()> {
        for uid in request_uids {
            if uid != NULL_UID && !self.adapters.contains_key(uid) {
                return Err(RuntimeError::Configuration(format!(
                    "request references unregistered LoRA UID '{uid}'"
                )));
            }
        }
        self.assigned = request_uids.to_vec();
        Ok(())
    }

    /// Rank and weight pointers for `batch_index`'s adapter at `layer`/
    /// `module`. The null UID (or no module entry for a non-null UID, e.g.
    /// an adapter that doesn't touch this layer) resolves to rank 0 with
    /// null pointers, meaning "no LoRA delta applied here".
    pub fn binding_for(&self, batch_index: usize, layer: usize, module: &str) -> LoraWeights {
        let uid = self.assigned.get(batch_index).map(String::as_str).unwrap_or(NULL_UID);
        if uid == NULL_UID {
            return LoraWeights {
                rank: 0,
                in_ptr: DevicePtr(0),
                out_ptr: DevicePtr(0),
            };
        }
        self.adapters
            .get(uid)
            .and_then(|adapter| adapter.module(layer, module))
            .copied()
            .unwrap_or(LoraWeights {
                rank: 0,
                in_ptr: DevicePtr(0),
                out_ptr: DevicePtr(0),
            })
    }

    pub fn assigned_uids(&self) -> &[String] {
        &self.assigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_adapter() -> LoraAdapter {
        let mut adapter = LoraAdapter::new();
        adapter.set_module(
            0,
            "attn_qkv",
            LoraWeights {
                rank: 8,
                in_ptr: DevicePtr(100),
                out_ptr: DevicePtr(200),
            },
        );
        adapter
    }

    #[test]
    fn null_uid_resolves_to_rank_zero() {
        let mut binder = LoraBinder::new();
        binder.setup(&[NULL_UID.to_string()]).unwrap();
        let binding = binder.binding_for(0, 0, "attn_qkv");
        assert_eq!(binding.rank, 0);
        assert_eq!(binding.in_ptr, DevicePtr(0));
    }

    #[test]
    fn registered_adapter_resolves_layer_and_module() {
        let mut binder = LoraBinder::new();
        binder.register("adapter-a", sample_adapter()).unwrap();
        binder.setup(&["adapter-a".to_string()]).unwrap();

        let binding = binder.binding_for(0, 0, "attn_qkv");
        assert_eq!(binding.rank, 8);
        assert_eq!(binding.in_ptr, DevicePtr(100));
    }

    #[test]
    fn module_not_touched_by_adapter_resolves_to_rank_zero() {
        let mut binder = LoraBinder::new();
        binder.register("adapter-a", sample_adapter()).unwrap();
        binder.setup(&["adapter-a".to_string()]).unwrap();

        let binding = binder.binding_for(0, 5, "mlp_gate");
        assert_eq!(binding.rank, 0);
    }

    #[test]
    fn unregistered_uid_is_rejected_at_setup() {
        let mut binder = LoraBinder::new();
        let err = binder.setup(&["missing".to_string()]).unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration(_)));
    }

    #[test]
    fn cannot_register_under_null_uid() {
        let mut binder = LoraBinder::new();
        let err = binder.register(NULL_UID, LoraAdapter::new()).unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration(_)));
    }
}
