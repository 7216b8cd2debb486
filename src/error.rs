//! Error taxonomy for the generation-session runtime

use thiserror::Error;

/// Errors raised by the generation-session core.
///
/// Configuration, invariant, and launch errors are fatal to the owning
/// session: the caller must construct a new session to recover. Resource
/// errors around CUDA-graph instantiation are recovered locally by the
/// runtime wrapper and never surface here.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The engine's declared IO tensor set does not match the set derived
    /// from `ModelConfig`/`Mapping`, or a `max_attention_window_size` vector
    /// has the wrong length, or the engine declares more than two
    /// optimization profiles.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Device/IPC-region allocation failed.
    #[error("resource error: {0}")]
    Resource(String),

    /// `execute_async` on the execution backend returned `false`.
    #[error("launch error: engine execution failed for tensor(s) {tensors:?}")]
    Launch { tensors: Vec<String> },

    /// A value passed to `decode` does not match what `setup` was called
    /// with (batch size, max context length, beam width).
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Propagated from the external sampling kernel / dynamic decoder.
    #[error("decoder error: {0}")]
    Decoder(String),

    /// Sampling or model configuration values failed validation
    /// (out-of-range penalty, conflicting flags, empty batch, etc).
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
