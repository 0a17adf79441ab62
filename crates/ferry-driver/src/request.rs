use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A job submitted by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SubmitRequest {
  /// Generated when absent.
  #[serde(default, alias = "prompt_id")]
  pub run_id: Option<String>,

  #[serde(alias = "workflow_api")]
  pub graph: Value,

  /// External-input values, keyed by the node's `input_id`.
  #[serde(default)]
  pub inputs: HashMap<String, Value>,

  #[serde(default)]
  pub status_endpoint: Option<String>,

  #[serde(default, alias = "file_upload_endpoint")]
  pub upload_url_endpoint: Option<String>,

  #[serde(default)]
  pub auth_token: Option<String>,

  /// Overrides the process-wide seed randomization setting.
  #[serde(default)]
  pub randomize_seeds: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitResponse {
  pub run_id: String,
  pub node_errors: Value,
}
