use ferry_reporter::ReportError;
use ferry_workflow::GraphError;

#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
  #[error("no streaming session '{0}'")]
  UnknownSession(String),

  #[error("cannot load template for workflow '{workflow_id}': {message}")]
  Template { workflow_id: String, message: String },

  #[error("invalid message: {0}")]
  InvalidMessage(String),

  #[error("invalid binary frame: {0}")]
  InvalidFrame(&'static str),

  #[error("submit failed: {0}")]
  Submit(String),

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Report(#[from] ReportError),
}
