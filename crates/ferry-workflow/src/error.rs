use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
  #[error("graph has no nodes")]
  Empty,

  #[error("node '{0}' has no class_type")]
  MissingClassType(String),

  #[error("invalid graph JSON: {0}")]
  Invalid(#[from] serde_json::Error),
}
