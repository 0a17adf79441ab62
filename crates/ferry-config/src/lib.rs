//! Ferry Config
//!
//! Serializable process configuration for the ferry worker. Every field has a
//! default, so an empty JSON object (or no file at all) yields a working
//! configuration:
//!
//! ```json
//! {
//!   "reporter": { "max_retries": 5, "base_delay_ms": 1000 },
//!   "upload": { "max_concurrent": 3, "output_root": "/comfyui/output" },
//!   "engine": { "base_url": "http://127.0.0.1:8188" }
//! }
//! ```
//!
//! The binary loads a file with [`Config::from_file`] and then applies
//! command-line overrides on top.

mod error;
mod sections;

pub use error::ConfigError;
pub use sections::{
  EngineConfig, LogsConfig, RegistryConfig, ReporterConfig, ServerConfig, StreamingConfig, UploadConfig,
  UploadFailurePolicy,
};

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level ferry configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub reporter: ReporterConfig,
  pub upload: UploadConfig,
  pub registry: RegistryConfig,
  pub engine: EngineConfig,
  pub server: ServerConfig,
  pub streaming: StreamingConfig,
  pub logs: LogsConfig,
}

impl Config {
  /// Load a configuration from a JSON file.
  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let config: Config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    config.validate()?;
    Ok(config)
  }

  /// Reject values that would leave the worker unable to make progress.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.reporter.max_retries == 0 {
      return Err(ConfigError::Invalid {
        field: "reporter.max_retries",
        message: "must be at least 1".to_string(),
      });
    }
    if self.reporter.backoff_base == 0 {
      return Err(ConfigError::Invalid {
        field: "reporter.backoff_base",
        message: "must be at least 1".to_string(),
      });
    }
    if self.upload.max_concurrent == 0 {
      return Err(ConfigError::Invalid {
        field: "upload.max_concurrent",
        message: "must be at least 1".to_string(),
      });
    }
    if self.logs.poll_ms == 0 {
      return Err(ConfigError::Invalid {
        field: "logs.poll_ms",
        message: "must be at least 1".to_string(),
      });
    }
    Ok(())
  }
}
