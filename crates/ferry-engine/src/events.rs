//! Engine events and notifiers.
//!
//! The engine reports every run as a sequence of events. Consumers register an
//! [`ExecutionNotifier`]; the usual choice is a [`ChannelNotifier`] feeding the
//! lifecycle driver.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::EngineError;

/// An event exactly as the engine sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineMessage {
  #[serde(rename = "type")]
  pub event: String,
  #[serde(default)]
  pub data: Value,
}

/// A decoded engine event.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
  /// The engine picked the run up.
  ExecutionStart { run_id: String },

  /// A node started executing. `node: None` means the graph has drained.
  Executing {
    run_id: String,
    node: Option<String>,
  },

  /// Nodes whose results were served from the engine's cache.
  ExecutionCached { run_id: String, nodes: Vec<String> },

  /// A node finished and reported output.
  Executed {
    run_id: String,
    node: String,
    output: Value,
  },

  /// The run failed inside the engine. `payload` is forwarded verbatim.
  ExecutionError { run_id: String, payload: Value },

  /// The run was interrupted.
  ExecutionInterrupted { run_id: String },

  /// Anything else (previews, per-step progress, queue status). Relayed only.
  Other { run_id: Option<String> },
}

impl EngineMessage {
  pub fn new(event: impl Into<String>, data: Value) -> Self {
    Self {
      event: event.into(),
      data,
    }
  }

  /// The run this event belongs to, if it names one.
  pub fn run_id(&self) -> Option<&str> {
    self
      .data
      .get("prompt_id")
      .or_else(|| self.data.get("run_id"))
      .and_then(Value::as_str)
  }

  pub fn decode(&self) -> Result<EngineEvent, EngineError> {
    let event = match self.event.as_str() {
      "execution_start" => EngineEvent::ExecutionStart {
        run_id: self.require_run_id()?,
      },
      "executing" => EngineEvent::Executing {
        run_id: self.require_run_id()?,
        node: self.node_field("node"),
      },
      "execution_cached" => EngineEvent::ExecutionCached {
        run_id: self.require_run_id()?,
        nodes: self
          .data
          .get("nodes")
          .and_then(Value::as_array)
          .map(|nodes| nodes.iter().filter_map(node_id).collect())
          .unwrap_or_default(),
      },
      "executed" => EngineEvent::Executed {
        run_id: self.require_run_id()?,
        node: self.node_field("node").ok_or_else(|| self.malformed("missing node"))?,
        output: self.data.get("output").cloned().unwrap_or(Value::Null),
      },
      "execution_error" => EngineEvent::ExecutionError {
        run_id: self.require_run_id()?,
        payload: self.data.clone(),
      },
      "execution_interrupted" => EngineEvent::ExecutionInterrupted {
        run_id: self.require_run_id()?,
      },
      _ => EngineEvent::Other {
        run_id: self.run_id().map(str::to_string),
      },
    };
    Ok(event)
  }

  fn require_run_id(&self) -> Result<String, EngineError> {
    self
      .run_id()
      .map(str::to_string)
      .ok_or_else(|| self.malformed("missing prompt_id"))
  }

  fn node_field(&self, key: &str) -> Option<String> {
    self.data.get(key).and_then(node_id)
  }

  fn malformed(&self, message: &str) -> EngineError {
    EngineError::MalformedEvent {
      event: self.event.clone(),
      message: message.to_string(),
    }
  }
}

/// Node ids arrive as strings, but some engines send numbers.
fn node_id(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Trait for receiving engine events.
///
/// The engine adapter calls `notify` for each event; implementations decide
/// what to do with them.
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, message: EngineMessage);
}

/// A notifier that forwards events to an unbounded channel.
///
/// Unbounded so a slow driver never blocks the engine; event volume is a few
/// messages per node.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<EngineMessage>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<EngineMessage>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, message: EngineMessage) {
    // Receiver may have been dropped during shutdown
    let _ = self.sender.send(message);
  }
}
