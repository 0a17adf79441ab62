use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use bytes::Bytes;
use ferry_driver::{SubmitRequest, SubmitResponse};
use ferry_engine::EngineMessage;
use ferry_protocol::events::binary;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn submit_run(
  State(state): State<AppState>,
  Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
  let response = state.driver.submit(request).await?;
  Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct RunQuery {
  #[serde(alias = "prompt_id")]
  run_id: String,
}

pub async fn run_status(
  State(state): State<AppState>,
  Query(query): Query<RunQuery>,
) -> Result<Json<Value>, ApiError> {
  let snapshot = state
    .registry
    .get(&query.run_id)
    .ok_or_else(|| ApiError::NotFound(format!("run '{}' not found", query.run_id)))?;
  Ok(Json(json!({
    "run_id": snapshot.run_id,
    "status": snapshot.status,
    "progress": snapshot.progress,
  })))
}

pub async fn cancel_run(
  State(state): State<AppState>,
  Json(request): Json<RunQuery>,
) -> Result<Json<Value>, ApiError> {
  let transition = state.driver.cancel(&request.run_id).await?;
  Ok(Json(json!({
    "run_id": request.run_id,
    "cancelled": transition.applied(),
    "status": state.registry.status(&request.run_id),
  })))
}

pub async fn engine_event(State(state): State<AppState>, Json(message): Json<EngineMessage>) -> StatusCode {
  debug!(event = %message.event, "engine event received");
  state.notifier.notify(message);
  StatusCode::ACCEPTED
}

#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
  #[serde(default, alias = "clientId")]
  client_id: Option<String>,
  #[serde(default)]
  kind: Option<u32>,
}

/// Raw preview bytes from the engine, forwarded as a binary frame.
pub async fn engine_preview(
  State(state): State<AppState>,
  Query(query): Query<PreviewQuery>,
  body: Bytes,
) -> Result<StatusCode, ApiError> {
  if body.is_empty() {
    return Err(ApiError::bad_request("empty preview"));
  }
  let kind = query.kind.unwrap_or(binary::PREVIEW_IMAGE);
  state
    .bridge
    .send_bytes(kind, &body, query.client_id.as_deref());
  Ok(StatusCode::ACCEPTED)
}
