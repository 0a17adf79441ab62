use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One node of a submitted graph.
///
/// Input values are either literals or links (`["<node_id>", <output_index>]`)
/// to another node's output; ferry never interprets links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
  pub class_type: String,
  #[serde(default)]
  pub inputs: Map<String, Value>,
  /// Anything else the engine attached (e.g. `_meta`), passed through untouched.
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl GraphNode {
  pub fn new(class_type: impl Into<String>) -> Self {
    Self {
      class_type: class_type.into(),
      inputs: Map::new(),
      extra: Map::new(),
    }
  }

  pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
    self.inputs.insert(key.into(), value);
    self
  }

  /// The external-input slot this node reads from, if it is one.
  pub fn input_id(&self) -> Option<&str> {
    self.inputs.get("input_id").and_then(Value::as_str)
  }
}
