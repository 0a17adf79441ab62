use std::collections::{BTreeMap, HashMap};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GraphError;
use crate::node::GraphNode;

/// A submitted node graph, keyed by node id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Graph {
  nodes: BTreeMap<String, GraphNode>,
}

impl Graph {
  pub fn new(nodes: BTreeMap<String, GraphNode>) -> Self {
    Self { nodes }
  }

  pub fn from_value(value: Value) -> Result<Self, GraphError> {
    let graph: Graph = serde_json::from_value(value)?;
    graph.validate()?;
    Ok(graph)
  }

  pub fn validate(&self) -> Result<(), GraphError> {
    if self.nodes.is_empty() {
      return Err(GraphError::Empty);
    }
    for (node_id, node) in &self.nodes {
      if node.class_type.trim().is_empty() {
        return Err(GraphError::MissingClassType(node_id.clone()));
      }
    }
    Ok(())
  }

  /// Number of executable nodes; the denominator for run progress.
  pub fn node_count(&self) -> usize {
    self.nodes.len()
  }

  pub fn get(&self, node_id: &str) -> Option<&GraphNode> {
    self.nodes.get(node_id)
  }

  pub fn insert(&mut self, node_id: impl Into<String>, node: GraphNode) {
    self.nodes.insert(node_id.into(), node);
  }

  pub fn nodes(&self) -> impl Iterator<Item = (&String, &GraphNode)> {
    self.nodes.iter()
  }

  /// Node id → class type, for labelling progress and outputs.
  pub fn node_classes(&self) -> HashMap<String, String> {
    self
      .nodes
      .iter()
      .map(|(id, node)| (id.clone(), node.class_type.clone()))
      .collect()
  }

  /// Replace every literal `seed` input with a fresh random seed.
  ///
  /// Linked seeds (`["node", 0]`) are left alone. Returns how many were replaced.
  pub fn randomize_seeds<R: Rng + ?Sized>(&mut self, rng: &mut R) -> usize {
    let mut replaced = 0;
    for node in self.nodes.values_mut() {
      if let Some(seed) = node.inputs.get_mut("seed")
        && seed.is_number()
      {
        *seed = Value::from(random_seed(rng));
        replaced += 1;
      }
    }
    replaced
  }

  /// Fill external-input nodes whose `input_id` matches a provided value.
  ///
  /// The value lands in the node's `default_value` input. Returns how many
  /// nodes were filled.
  pub fn apply_inputs(&mut self, inputs: &HashMap<String, Value>) -> usize {
    let mut applied = 0;
    for node in self.nodes.values_mut() {
      let Some(value) = node.input_id().and_then(|id| inputs.get(id)).cloned() else {
        continue;
      };
      node.inputs.insert("default_value".to_string(), value);
      applied += 1;
    }
    applied
  }

  /// Point every node that exposes a `client_id` input at the given session.
  pub fn set_client_id(&mut self, client_id: &str) {
    for node in self.nodes.values_mut() {
      if node.inputs.contains_key("client_id") {
        node
          .inputs
          .insert("client_id".to_string(), Value::from(client_id));
      }
    }
  }
}

/// A random 15-digit seed.
pub fn random_seed<R: Rng + ?Sized>(rng: &mut R) -> u64 {
  rng.gen_range(100_000_000_000_000..=999_999_999_999_999)
}
