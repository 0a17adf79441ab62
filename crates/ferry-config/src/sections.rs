use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry and timeout settings for outbound calls to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
  /// Connect timeout. There is no cap on total request duration.
  pub connect_timeout_ms: u64,
  /// Total number of attempts per call.
  pub max_retries: u32,
  /// Exponent base for the backoff delay.
  pub backoff_base: u32,
  /// Delay after the first failed attempt.
  pub base_delay_ms: u64,
}

impl ReporterConfig {
  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }

  pub fn base_delay(&self) -> Duration {
    Duration::from_millis(self.base_delay_ms)
  }
}

impl Default for ReporterConfig {
  fn default() -> Self {
    Self {
      connect_timeout_ms: 5_000,
      max_retries: 5,
      backoff_base: 2,
      base_delay_ms: 1_000,
    }
  }
}

/// What an exhausted upload does to its run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadFailurePolicy {
  /// The owning run becomes FAILED.
  #[default]
  FailRun,
  /// The failure is reported as output; the run may still succeed.
  BestEffort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
  pub max_concurrent: usize,
  /// Minimum spacing between two upload start times.
  pub stagger_ms: u64,
  /// Engine output directory. Files outside it are never uploaded.
  pub output_root: PathBuf,
  /// Engine temp directory, used for artifacts with `type: "temp"`.
  pub temp_root: Option<PathBuf>,
  pub failure_policy: UploadFailurePolicy,
}

impl UploadConfig {
  pub fn stagger(&self) -> Duration {
    Duration::from_millis(self.stagger_ms)
  }
}

impl Default for UploadConfig {
  fn default() -> Self {
    Self {
      max_concurrent: 3,
      stagger_ms: 50,
      output_root: PathBuf::from("output"),
      temp_root: None,
      failure_policy: UploadFailurePolicy::default(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
  /// How long a finished run stays matchable for late engine events.
  pub retain_finished_ms: u64,
  pub sweep_interval_ms: u64,
}

impl RegistryConfig {
  pub fn retain_finished(&self) -> Duration {
    Duration::from_millis(self.retain_finished_ms)
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_millis(self.sweep_interval_ms)
  }
}

impl Default for RegistryConfig {
  fn default() -> Self {
    Self {
      retain_finished_ms: 300_000,
      sweep_interval_ms: 30_000,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Base URL of the node-graph engine's HTTP API.
  pub base_url: String,
  /// Replace every `seed` input with a random 15-digit value on submit.
  pub randomize_seeds: bool,
  /// Relay every engine event to the status endpoint as `ws_event`.
  pub forward_engine_events: bool,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      base_url: "http://127.0.0.1:8188".to_string(),
      randomize_seeds: true,
      forward_engine_events: false,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  pub bind: SocketAddr,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8189)),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
  /// Control-plane endpoint serving workflow templates by `workflow_id`.
  pub template_endpoint: Option<String>,
  /// Bearer token for the template endpoint.
  pub auth_token: Option<String>,
}

/// Engine log file streamed to live sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
  /// File to follow. Log streaming is off when unset.
  pub path: Option<PathBuf>,
  /// How often the file is checked for new lines.
  pub poll_ms: u64,
  /// Most of the file's tail sent to a session when it connects.
  pub snapshot_bytes: u64,
}

impl LogsConfig {
  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_ms)
  }
}

impl Default for LogsConfig {
  fn default() -> Self {
    Self {
      path: None,
      poll_ms: 1_000,
      snapshot_bytes: 1024 * 1024,
    }
  }
}
