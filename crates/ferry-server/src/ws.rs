use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use ferry_bridge::{EventBridge, Frame, LogTail, SessionHandle};
use ferry_protocol::events;
use ferry_streaming::StreamingError;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
  #[serde(default, rename = "clientId", alias = "client_id")]
  client_id: Option<String>,
  #[serde(default)]
  workflow_id: Option<String>,
}

/// Live event session. Receives run events, previews and broadcasts.
pub async fn events_ws(
  ws: WebSocketUpgrade,
  State(state): State<AppState>,
  Query(query): Query<SessionQuery>,
) -> Response {
  let bridge = state.bridge.clone();
  let logs = state.logs.clone();
  ws.on_upgrade(move |socket| serve_events(socket, bridge, logs, query.client_id))
}

async fn serve_events(
  mut socket: WebSocket,
  bridge: Arc<EventBridge>,
  logs: Option<Arc<LogTail>>,
  client_id: Option<String>,
) {
  let mut handle = open_events(&bridge, logs.as_deref(), client_id).await;
  let session_id = handle.session_id.clone();
  info!(session_id = %session_id, "event session connected");

  loop {
    tokio::select! {
      frame = handle.recv() => {
        // None: replaced by a reconnect under the same id
        let Some(frame) = frame else { break };
        if socket.send(to_message(frame)).await.is_err() {
          break;
        }
      }
      message = socket.recv() => {
        match message {
          Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
          _ => {}
        }
      }
    }
  }

  bridge.unregister(&session_id, handle.generation());
  info!(session_id = %session_id, "event session closed");
}

/// Register an event session; it starts with the engine log's tail.
pub(crate) async fn open_events(
  bridge: &EventBridge,
  logs: Option<&LogTail>,
  client_id: Option<String>,
) -> SessionHandle {
  let handle = bridge.register(client_id);
  if let Some(logs) = logs {
    logs.greet(bridge, &handle.session_id).await;
  }
  handle
}

/// Realtime streaming session. Every accepted input resubmits the template.
pub async fn streaming_ws(
  ws: WebSocketUpgrade,
  State(state): State<AppState>,
  Query(query): Query<SessionQuery>,
) -> Result<Response, ApiError> {
  let session_id = query
    .client_id
    .filter(|id| !id.is_empty())
    .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
  state
    .sessions
    .open(&session_id, query.workflow_id.as_deref())
    .await?;

  Ok(ws.on_upgrade(move |socket| serve_streaming(socket, state, session_id)))
}

async fn serve_streaming(mut socket: WebSocket, state: AppState, session_id: String) {
  let mut handle = state.bridge.register(Some(session_id.clone()));
  let mut replaced = false;
  info!(session_id = %session_id, "streaming session connected");

  loop {
    tokio::select! {
      frame = handle.recv() => {
        let Some(frame) = frame else {
          replaced = true;
          break;
        };
        if socket.send(to_message(frame)).await.is_err() {
          break;
        }
      }
      message = socket.recv() => {
        let result = match message {
          Some(Ok(Message::Text(text))) => state.sessions.handle_text(&session_id, text.as_str()).await,
          Some(Ok(Message::Binary(bytes))) => state.sessions.handle_binary(&session_id, &bytes).await,
          Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
          Some(Ok(_)) => continue,
        };
        if let Some(frame) = rejection(result)
          && socket.send(to_message(frame)).await.is_err()
        {
          break;
        }
      }
    }
  }

  // A reconnect under the same id owns the session now
  if !replaced {
    state.sessions.close(&session_id).await;
  }
  state.bridge.unregister(&session_id, handle.generation());
  info!(session_id = %session_id, "streaming session closed");
}

pub(crate) fn to_message(frame: Frame) -> Message {
  match frame {
    Frame::Text(text) => Message::Text(text.into()),
    Frame::Binary(bytes) => Message::Binary(bytes),
  }
}

/// The frame telling the client its message was refused, if it was.
pub(crate) fn rejection(result: Result<Option<String>, StreamingError>) -> Option<Frame> {
  match result {
    Ok(Some(run_id)) => {
      debug!(run_id = %run_id, "streaming run submitted");
      None
    }
    Ok(None) => None,
    Err(e) => {
      warn!(error = %e, "streaming message refused");
      Some(Frame::event(events::ERROR, json!({ "message": e.to_string() })))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;

  #[test]
  fn test_frames_map_to_messages() {
    let text = to_message(Frame::event("status", json!({"sid": "s1"})));
    let Message::Text(text) = text else {
      panic!("expected text message");
    };
    assert!(text.as_str().contains("\"sid\":\"s1\""));

    let binary = to_message(Frame::Binary(Bytes::from_static(&[0, 0, 0, 1, 9])));
    assert_eq!(binary, Message::Binary(Bytes::from_static(&[0, 0, 0, 1, 9])));
  }

  #[test]
  fn test_only_errors_are_answered() {
    assert!(rejection(Ok(Some("r1".to_string()))).is_none());
    assert!(rejection(Ok(None)).is_none());

    let frame = rejection(Err(StreamingError::InvalidFrame("frame shorter than header"))).unwrap();
    let Frame::Text(text) = frame else {
      panic!("expected text frame");
    };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["event"], "error");
    assert!(value["data"]["message"].as_str().unwrap().contains("shorter"));
  }

  async fn next_event(handle: &mut SessionHandle) -> serde_json::Value {
    let Some(Frame::Text(text)) = handle.recv().await else {
      panic!("expected text frame");
    };
    serde_json::from_str(&text).unwrap()
  }

  #[tokio::test]
  async fn test_event_session_starts_with_engine_log() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("engine.log");
    std::fs::write(&path, "loading model\nready\n").unwrap();
    let logs = LogTail::new(&path, std::time::Duration::from_secs(1), 4096);
    let bridge = EventBridge::new();

    let mut handle = open_events(&bridge, Some(&logs), Some("c1".to_string())).await;
    let status = next_event(&mut handle).await;
    assert_eq!(status["event"], "status");
    assert_eq!(status["data"]["sid"], "c1");
    let log = next_event(&mut handle).await;
    assert_eq!(log["event"], events::LOGS);
    assert_eq!(log["data"], "loading model\nready\n");
  }

  #[tokio::test]
  async fn test_event_session_without_log_gets_only_status() {
    let bridge = EventBridge::new();
    let mut handle = open_events(&bridge, None, Some("c1".to_string())).await;
    assert_eq!(next_event(&mut handle).await["event"], "status");

    let nothing = tokio::time::timeout(std::time::Duration::from_millis(50), handle.recv()).await;
    assert!(nothing.is_err());
  }
}
