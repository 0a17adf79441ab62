use std::path::PathBuf;

use ferry_reporter::ReportError;

/// Errors from a single upload task.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
  /// The artifact points outside the engine's directories. Never retried.
  #[error("refusing to upload '{path}': {reason}")]
  Forbidden { path: String, reason: &'static str },

  #[error("cannot read {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("run {run_id} has no upload endpoint")]
  MissingEndpoint { run_id: String },

  #[error("run {run_id} is no longer registered")]
  RunGone { run_id: String },

  #[error(transparent)]
  Report(#[from] ReportError),
}

impl UploadError {
  pub fn is_forbidden(&self) -> bool {
    matches!(self, UploadError::Forbidden { .. })
  }
}
