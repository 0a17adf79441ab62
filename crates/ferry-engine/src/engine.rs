use async_trait::async_trait;
use ferry_workflow::Graph;
use serde_json::Value;

use crate::error::EngineError;

/// A graph ready to be handed to the engine.
#[derive(Debug, Clone)]
pub struct Job {
  pub run_id: String,
  pub graph: Graph,
  /// Session that should receive the engine's own preview traffic, if any.
  pub client_id: Option<String>,
}

/// The engine's acknowledgement of an accepted job.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
  pub run_id: String,
  /// Queue position reported by the engine.
  pub number: Option<u64>,
  /// Per-node validation problems. Non-empty does not mean rejected.
  pub node_errors: Value,
}

impl Submission {
  pub fn has_node_errors(&self) -> bool {
    match &self.node_errors {
      Value::Null => false,
      Value::Object(map) => !map.is_empty(),
      Value::Array(list) => !list.is_empty(),
      _ => true,
    }
  }
}

/// The node-graph execution engine.
///
/// Ferry only submits and interrupts; everything else arrives as events
/// through an [`ExecutionNotifier`](crate::ExecutionNotifier).
#[async_trait]
pub trait Engine: Send + Sync {
  async fn submit(&self, job: Job) -> Result<Submission, EngineError>;

  async fn interrupt(&self, run_id: &str) -> Result<(), EngineError>;
}
