use ferry_engine::EngineError;
use ferry_workflow::GraphError;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
  #[error("invalid graph: {0}")]
  Graph(#[from] GraphError),

  #[error("run '{0}' already exists")]
  DuplicateRun(String),

  #[error("run '{0}' not found")]
  UnknownRun(String),

  #[error("engine submission failed: {0}")]
  Engine(#[from] EngineError),
}
