//! gen-session-core: a generation-session runtime for autoregressive LLM
//! inference engines.
//!
//! This crate drives the prefill ("context") phase and the iterative decode
//! loop around a pre-compiled, opaque GPU engine artifact. It owns
//! execution-context ping-pong, KV-cache bookkeeping (paged and contiguous),
//! dynamic decoding (penalties, top-k/top-p, beam search), LoRA weight
//! binding, the custom all-reduce IPC workspace, and pipeline-parallel
//! cross-rank glue. It does not compile or execute engines itself: that
//! boundary is the [`backend::ExecutionBackend`] trait, which production
//! integrators implement against their own GPU runtime.
//!
//! ## Example
//!
//! ```no_run
//! use gen_session_core::backend::{FakeExecutionBackend, StreamHandle};
//! use gen_session_core::mapping::Mapping;
//! use gen_session_core::model_config::ModelConfig;
//! use gen_session_core::sampling_config::SamplingConfig;
//! use gen_session_core::session::GenerationSession;
//! use gen_session_core::variant::ModelVariant;
//!
//! let backend = FakeExecutionBackend::new(vec!["logits".to_string()], 1);
//! let model_config = ModelConfig::new(32000, 32, 32, 4096);
//! let mapping = Mapping::single_gpu();
//!
//! let mut session = GenerationSession::new(
//!     backend,
//!     &[],
//!     model_config,
//!     mapping,
//!     ModelVariant::Standard,
//!     StreamHandle(0),
//!     false,
//!     false,
//! ).unwrap();
//!
//! let sampling = SamplingConfig::new(2, 0).with_max_new_tokens(8);
//! session.setup(1, 1, 4, sampling, None, None).unwrap();
//! session.context_step(&[vec![10, 11, 12, 13]]).unwrap();
//! let _ = session.run_to_completion();
//! ```

pub mod backend;
pub mod config;
pub mod decoder;
pub mod error;
pub mod gather_tree;
pub mod ipc;
pub mod kv_cache;
pub mod lora;
pub mod mapping;
pub mod model_config;
pub mod runtime;
pub mod sampling_config;
pub mod session;
pub mod variant;
pub mod word_list;

pub use config::RuntimeOptions;
pub use error::{Result, RuntimeError};
pub use mapping::Mapping;
pub use model_config::ModelConfig;
pub use sampling_config::SamplingConfig;
pub use session::{GenerationSession, SessionState};
