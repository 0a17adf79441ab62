use serde::{Deserialize, Serialize};

use crate::status::RunStatus;

/// Identifies the node an `output_data` update belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
  pub node_id: String,
  pub node_class: String,
}

/// An engine or bridge event relayed to the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsEvent {
  pub event: String,
  pub data: serde_json::Value,
}

/// Body of a POST to a run's status endpoint.
///
/// The receiver is expected to be idempotent; any of these may be delivered
/// more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusUpdate {
  Status {
    run_id: String,
    status: RunStatus,
  },
  LiveStatus {
    run_id: String,
    live_status: String,
    progress: f64,
  },
  Output {
    run_id: String,
    output_data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_meta: Option<NodeMeta>,
  },
  Event {
    run_id: String,
    ws_event: WsEvent,
  },
}

impl StatusUpdate {
  pub fn run_id(&self) -> &str {
    match self {
      StatusUpdate::Status { run_id, .. }
      | StatusUpdate::LiveStatus { run_id, .. }
      | StatusUpdate::Output { run_id, .. }
      | StatusUpdate::Event { run_id, .. } => run_id,
    }
  }

  /// An `output_data` update carrying an error object.
  pub fn error(run_id: impl Into<String>, error: serde_json::Value) -> Self {
    StatusUpdate::Output {
      run_id: run_id.into(),
      output_data: serde_json::json!({ "error": error }),
      node_meta: None,
    }
  }
}
