use std::net::SocketAddr;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ferry_driver::DriverError;
use ferry_engine::EngineError;
use ferry_streaming::StreamingError;
use serde::Serialize;
use serde_json::Value;

/// Failure to start or keep serving.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
  #[error("failed to bind {addr}: {source}")]
  Bind {
    addr: SocketAddr,
    #[source]
    source: std::io::Error,
  },

  #[error("server error: {0}")]
  Serve(#[from] std::io::Error),
}

/// An error answered to an HTTP caller.
#[derive(Debug)]
pub enum ApiError {
  BadRequest {
    message: String,
    node_errors: Option<Value>,
  },
  NotFound(String),
  Conflict(String),
  BadGateway(String),
}

#[derive(Serialize)]
struct ErrorResponse {
  error: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  node_errors: Option<Value>,
}

impl ApiError {
  pub fn bad_request(message: impl Into<String>) -> Self {
    ApiError::BadRequest {
      message: message.into(),
      node_errors: None,
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, error, node_errors) = match self {
      ApiError::BadRequest {
        message,
        node_errors,
      } => (StatusCode::BAD_REQUEST, message, node_errors),
      ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message, None),
      ApiError::Conflict(message) => (StatusCode::CONFLICT, message, None),
      ApiError::BadGateway(message) => (StatusCode::BAD_GATEWAY, message, None),
    };
    (status, Json(ErrorResponse { error, node_errors })).into_response()
  }
}

impl From<DriverError> for ApiError {
  fn from(err: DriverError) -> Self {
    match err {
      DriverError::Graph(e) => ApiError::bad_request(e.to_string()),
      DriverError::DuplicateRun(_) => ApiError::Conflict(err.to_string()),
      DriverError::UnknownRun(_) => ApiError::NotFound(err.to_string()),
      DriverError::Engine(EngineError::Rejected {
        message,
        node_errors,
      }) => ApiError::BadRequest {
        message,
        node_errors: Some(node_errors),
      },
      DriverError::Engine(e) => ApiError::BadGateway(e.to_string()),
    }
  }
}

impl From<StreamingError> for ApiError {
  fn from(err: StreamingError) -> Self {
    match err {
      StreamingError::Template { .. } | StreamingError::Report(_) => {
        ApiError::BadGateway(err.to_string())
      }
      StreamingError::UnknownSession(_) => ApiError::NotFound(err.to_string()),
      other => ApiError::bad_request(other.to_string()),
    }
  }
}
