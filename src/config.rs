//! Runtime options: the ambient, non-model configuration layer
//!
//! Grounded on the teacher's `config/mod.rs::ProductionConfig` (TOML file +
//! env-var override + `validate()` returning a `Vec<String>` of all
//! violations at once, rather than bailing on the first). Scoped down from
//! the teacher's server/model/RAG settings to the session-constructor
//! parameters this crate actually owns: debug mode, CUDA-graph mode, stream
//! count, and KV-cache mode selection.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KvCacheMode {
    #[default]
    Paged,
    Contiguous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Synchronize the stream after every launch and log tensor shapes;
    /// mirrors the prose contract's "debug mode" throughout §4.
    pub debug_mode: bool,
    /// Enable the CUDA-graph capture/update fast path for the generation
    /// phase.
    pub cuda_graph_mode: bool,
    /// Number of streams to round-robin across concurrent sessions.
    pub stream_count: usize,
    pub kv_cache_mode: KvCacheMode,
    /// Logging configuration, named and shaped like the teacher's
    /// `LoggingConfig`.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            timestamps: true,
        }
    }
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            debug_mode: false,
            cuda_graph_mode: true,
            stream_count: 1,
            kv_cache_mode: KvCacheMode::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeOptions {
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path).map_err(|e| format!("failed to read config file: {e}"))?;
        toml::from_str(&contents).map_err(|e| format!("failed to parse config: {e}"))
    }

    /// Load from `GEN_SESSION_CONFIG` if set, falling back to defaults, then
    /// apply environment overrides. Mirrors the teacher's `ProductionConfig::load`.
    pub fn load() -> Self {
        let mut options = if let Ok(path) = std::env::var("GEN_SESSION_CONFIG") {
            match Self::from_file(&path) {
                Ok(cfg) => {
                    info!(path, "loaded runtime options from file");
                    cfg
                }
                Err(e) => {
                    warn!(path, error = %e, "failed to load runtime options, using defaults");
                    Self::default()
                }
            }
        } else {
            Self::default()
        };
        options.apply_env_overrides();
        options
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GEN_SESSION_DEBUG") {
            self.debug_mode = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("GEN_SESSION_CUDA_GRAPH") {
            self.cuda_graph_mode = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("GEN_SESSION_STREAM_COUNT") {
            if let Ok(n) = v.parse() {
                self.stream_count = n;
            }
        }
        if let Ok(v) = std::env::var("GEN_SESSION_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.stream_count == 0 {
            errors.push("stream_count must be at least 1".to_string());
        }
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            errors.push(format!("unknown log level '{}'", self.logging.level));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("failed to serialize config: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        assert!(RuntimeOptions::default().validate().is_ok());
    }

    #[test]
    fn zero_stream_count_is_rejected() {
        let mut options = RuntimeOptions::default();
        options.stream_count = 0;
        assert!(options.validate().is_err());
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let mut options = RuntimeOptions::default();
        options.logging.level = "verbose".to_string();
        assert!(options.validate().is_err());
    }

    #[test]
    fn toml_roundtrip_produces_nonempty_string() {
        let options = RuntimeOptions::default();
        let toml_str = options.to_toml().unwrap();
        assert!(!toml_str.is_empty());
        let parsed: RuntimeOptions = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.stream_count, options.stream_count);
    }
}
