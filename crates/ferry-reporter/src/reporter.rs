use bytes::Bytes;
use ferry_config::ReporterConfig;
use ferry_protocol::StatusUpdate;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::ReportError;
use crate::retry::RetryPolicy;

/// What to send with a request. Cloned for every attempt.
#[derive(Debug, Clone, Default)]
pub enum Payload {
  #[default]
  Empty,
  Json(Value),
  Query(Vec<(String, String)>),
  Bytes {
    data: Bytes,
    content_type: String,
    headers: Vec<(String, String)>,
  },
}

/// Retrying HTTP client for control-plane calls.
///
/// Only a connect timeout is set: artifact PUTs can legitimately take minutes.
#[derive(Debug, Clone)]
pub struct StatusReporter {
  client: Client,
  policy: RetryPolicy,
}

impl StatusReporter {
  pub fn new(config: &ReporterConfig) -> Result<Self, ReportError> {
    let client = Client::builder()
      .connect_timeout(config.connect_timeout())
      .build()
      .map_err(ReportError::Client)?;
    Ok(Self::with_client(client, RetryPolicy::from(config)))
  }

  pub fn with_client(client: Client, policy: RetryPolicy) -> Self {
    Self { client, policy }
  }

  pub fn policy(&self) -> RetryPolicy {
    self.policy
  }

  /// Send a request, retrying transport errors and non-2xx responses.
  ///
  /// Returns the first successful response. The bearer token, when given, is
  /// attached to every attempt.
  pub async fn send(
    &self,
    method: Method,
    endpoint: &str,
    token: Option<&str>,
    payload: Payload,
  ) -> Result<Response, ReportError> {
    let mut last_error = String::new();

    for attempt in 0..self.policy.max_attempts {
      let request = self.build(method.clone(), endpoint, token, &payload);

      match request.send().await {
        Ok(response) if response.status().is_success() => {
          if attempt > 0 {
            debug!(%method, endpoint, attempt, "request succeeded after retry");
          }
          return Ok(response);
        }
        Ok(response) => {
          let status = response.status();
          let body = response.text().await.unwrap_or_default();
          warn!(
            %method,
            endpoint,
            attempt,
            status = status.as_u16(),
            body = %body,
            "control plane rejected request"
          );
          last_error = format!("status {status}");
        }
        Err(e) => {
          warn!(%method, endpoint, attempt, error = %e, "request failed");
          last_error = e.to_string();
        }
      }

      if attempt + 1 < self.policy.max_attempts {
        tokio::time::sleep(self.policy.delay(attempt)).await;
      }
    }

    Err(ReportError::Exhausted {
      method: method.to_string(),
      endpoint: endpoint.to_string(),
      attempts: self.policy.max_attempts,
      last_error,
    })
  }

  /// POST one status update to a run's status endpoint.
  #[instrument(skip(self, token, update), fields(run_id = %update.run_id()))]
  pub async fn post_update(
    &self,
    endpoint: &str,
    token: Option<&str>,
    update: &StatusUpdate,
  ) -> Result<(), ReportError> {
    let body = serde_json::to_value(update).map_err(|e| ReportError::Decode {
      endpoint: endpoint.to_string(),
      message: e.to_string(),
    })?;
    self
      .send(Method::POST, endpoint, token, Payload::Json(body))
      .await?;
    Ok(())
  }

  /// GET a JSON document, with query parameters.
  pub async fn get_json<T: DeserializeOwned>(
    &self,
    endpoint: &str,
    token: Option<&str>,
    query: Vec<(String, String)>,
  ) -> Result<T, ReportError> {
    let response = self
      .send(Method::GET, endpoint, token, Payload::Query(query))
      .await?;
    response.json::<T>().await.map_err(|e| ReportError::Decode {
      endpoint: endpoint.to_string(),
      message: e.to_string(),
    })
  }

  /// PUT raw bytes, typically to a pre-signed URL.
  pub async fn put_bytes(
    &self,
    url: &str,
    data: Bytes,
    content_type: &str,
    headers: Vec<(String, String)>,
  ) -> Result<(), ReportError> {
    let payload = Payload::Bytes {
      data,
      content_type: content_type.to_string(),
      headers,
    };
    self.send(Method::PUT, url, None, payload).await?;
    Ok(())
  }

  fn build(
    &self,
    method: Method,
    endpoint: &str,
    token: Option<&str>,
    payload: &Payload,
  ) -> RequestBuilder {
    let mut request = self.client.request(method, endpoint);

    if let Some(token) = token {
      request = request.bearer_auth(token);
    }

    match payload {
      Payload::Empty => request,
      Payload::Json(body) => request.json(body),
      Payload::Query(query) => request.query(query),
      Payload::Bytes {
        data,
        content_type,
        headers,
      } => {
        request = request.header(CONTENT_TYPE, content_type.as_str());
        for (key, value) in headers {
          request = request.header(key.as_str(), value.as_str());
        }
        request.body(data.clone())
      }
    }
  }
}
