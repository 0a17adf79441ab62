use std::sync::Arc;

use async_trait::async_trait;
use ferry_reporter::StatusReporter;
use ferry_workflow::Graph;
use serde_json::Value;

use crate::error::StreamingError;

/// Where streaming sessions get their workflow template from.
#[async_trait]
pub trait TemplateSource: Send + Sync {
  async fn fetch(&self, workflow_id: &str) -> Result<Graph, StreamingError>;
}

/// Fetches templates from the control plane: `GET {endpoint}?workflow_id=..`.
///
/// The response is either the graph itself or an object wrapping it under
/// `workflow_api`.
pub struct HttpTemplateSource {
  reporter: Arc<StatusReporter>,
  endpoint: String,
  auth_token: Option<String>,
}

impl HttpTemplateSource {
  pub fn new(reporter: Arc<StatusReporter>, endpoint: impl Into<String>, auth_token: Option<String>) -> Self {
    Self {
      reporter,
      endpoint: endpoint.into(),
      auth_token,
    }
  }
}

#[async_trait]
impl TemplateSource for HttpTemplateSource {
  async fn fetch(&self, workflow_id: &str) -> Result<Graph, StreamingError> {
    let mut body: Value = self
      .reporter
      .get_json(
        &self.endpoint,
        self.auth_token.as_deref(),
        vec![("workflow_id".to_string(), workflow_id.to_string())],
      )
      .await?;

    let graph = if body.get("workflow_api").is_some() {
      body["workflow_api"].take()
    } else {
      body
    };
    Graph::from_value(graph).map_err(|e| StreamingError::Template {
      workflow_id: workflow_id.to_string(),
      message: e.to_string(),
    })
  }
}

/// No template endpoint configured: every session must send its own graph.
pub struct NoTemplates;

#[async_trait]
impl TemplateSource for NoTemplates {
  async fn fetch(&self, workflow_id: &str) -> Result<Graph, StreamingError> {
    Err(StreamingError::Template {
      workflow_id: workflow_id.to_string(),
      message: "no template endpoint configured".to_string(),
    })
  }
}
