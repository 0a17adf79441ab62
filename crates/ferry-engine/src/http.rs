use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::engine::{Engine, Job, Submission};
use crate::error::EngineError;

/// Engine adapter that talks to the engine's HTTP API.
///
/// Events are not polled: the engine-side plugin pushes them to ferry's
/// `/engine/events` endpoint.
#[derive(Debug, Clone)]
pub struct HttpEngine {
  client: Client,
  base_url: String,
}

/// Expected body of an accepted submission.
#[derive(Debug, Deserialize)]
struct PromptAccepted {
  prompt_id: Option<String>,
  number: Option<u64>,
  #[serde(default)]
  node_errors: Value,
}

/// Expected body of a rejected submission.
#[derive(Debug, Deserialize)]
struct PromptRejected {
  #[serde(default)]
  error: Value,
  #[serde(default)]
  node_errors: Value,
}

impl HttpEngine {
  /// Build an adapter whose connections give up after `connect_timeout`.
  pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self, EngineError> {
    let client = Client::builder().connect_timeout(connect_timeout).build()?;
    Ok(Self::with_client(client, base_url))
  }

  pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
    let base_url = base_url.into().trim_end_matches('/').to_string();
    Self { client, base_url }
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  fn url(&self, path: &str) -> String {
    format!("{}/{}", self.base_url, path)
  }
}

#[async_trait]
impl Engine for HttpEngine {
  async fn submit(&self, job: Job) -> Result<Submission, EngineError> {
    let body = json!({
      "prompt": job.graph,
      "prompt_id": job.run_id,
      "client_id": job.client_id,
    });

    let response = self.client.post(self.url("prompt")).json(&body).send().await?;
    let status = response.status();
    let text = response.text().await?;

    if status.is_success() {
      let accepted: PromptAccepted =
        serde_json::from_str(&text).map_err(|_| EngineError::UnexpectedStatus {
          status: status.as_u16(),
          body: text.clone(),
        })?;
      debug!(run_id = %job.run_id, number = ?accepted.number, "engine accepted job");
      return Ok(Submission {
        run_id: accepted.prompt_id.unwrap_or(job.run_id),
        number: accepted.number,
        node_errors: accepted.node_errors,
      });
    }

    if status.is_client_error() {
      // Validation failures come back as 400 with a structured body
      if let Ok(rejected) = serde_json::from_str::<PromptRejected>(&text) {
        warn!(run_id = %job.run_id, status = status.as_u16(), "engine rejected job");
        return Err(EngineError::Rejected {
          message: error_message(&rejected.error),
          node_errors: rejected.node_errors,
        });
      }
    }

    Err(EngineError::UnexpectedStatus {
      status: status.as_u16(),
      body: text,
    })
  }

  async fn interrupt(&self, run_id: &str) -> Result<(), EngineError> {
    let response = self
      .client
      .post(self.url("interrupt"))
      .json(&json!({ "prompt_id": run_id }))
      .send()
      .await?;

    match response.status() {
      status if status.is_success() => Ok(()),
      // Already finished or never queued
      StatusCode::NOT_FOUND => Ok(()),
      status => Err(EngineError::UnexpectedStatus {
        status: status.as_u16(),
        body: response.text().await.unwrap_or_default(),
      }),
    }
  }
}

/// The engine reports errors either as a string or as `{type, message, details}`.
fn error_message(error: &Value) -> String {
  match error {
    Value::String(message) => message.clone(),
    Value::Object(map) => map
      .get("message")
      .and_then(Value::as_str)
      .map(str::to_string)
      .unwrap_or_else(|| error.to_string()),
    Value::Null => "unknown error".to_string(),
    other => other.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_message_shapes() {
    assert_eq!(error_message(&json!("boom")), "boom");
    assert_eq!(
      error_message(&json!({"type": "prompt_no_outputs", "message": "no outputs"})),
      "no outputs"
    );
    assert_eq!(error_message(&Value::Null), "unknown error");
  }

  #[test]
  fn test_base_url_trailing_slash() {
    let engine = HttpEngine::with_client(Client::new(), "http://127.0.0.1:8188/");
    assert_eq!(engine.url("prompt"), "http://127.0.0.1:8188/prompt");
  }
}
