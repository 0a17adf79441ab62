//! Engine boundary errors.

/// Errors returned by an [`Engine`](crate::Engine) or while decoding its events.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// The engine refused the job (invalid graph, missing models, ...).
  #[error("engine rejected job: {message}")]
  Rejected {
    message: String,
    node_errors: serde_json::Value,
  },

  /// The engine answered with an unexpected HTTP status.
  #[error("engine returned {status}: {body}")]
  UnexpectedStatus { status: u16, body: String },

  /// The request never completed.
  #[error("engine request failed: {0}")]
  Http(#[from] reqwest::Error),

  /// An event envelope was missing required fields.
  #[error("malformed '{event}' event: {message}")]
  MalformedEvent { event: String, message: String },
}
