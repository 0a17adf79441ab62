//! Ferry Server
//!
//! The axum surface of the worker:
//!
//! | route                              | purpose                                  |
//! |------------------------------------|------------------------------------------|
//! | `POST /run`                        | submit a job                             |
//! | `GET /status?run_id=`              | current status of a run                  |
//! | `POST /cancel`                     | interrupt a run                          |
//! | `GET /ws?clientId=`                | live event session                       |
//! | `GET /runs/{run_id}/events`        | server-sent events for one run           |
//! | `GET /streaming/ws?workflow_id=`   | realtime streaming session               |
//! | `POST /engine/events`              | events pushed by the engine              |
//! | `POST /engine/preview`             | binary previews pushed by the engine     |

mod error;
mod routes;
mod sse;
mod state;
mod ws;

use std::net::SocketAddr;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use error::{ApiError, ServerError};
pub use state::AppState;

/// Graphs and preview images can be large.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/run", post(routes::submit_run))
    .route("/status", get(routes::run_status))
    .route("/cancel", post(routes::cancel_run))
    .route("/ws", get(ws::events_ws))
    .route("/runs/{run_id}/events", get(sse::run_events))
    .route("/streaming/ws", get(ws::streaming_ws))
    .route("/engine/events", post(routes::engine_event))
    .route("/engine/preview", post(routes::engine_preview))
    .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
    .with_state(state)
}

/// Serve until `cancel` fires.
pub async fn serve(addr: SocketAddr, state: AppState, cancel: CancellationToken) -> Result<(), ServerError> {
  let listener = tokio::net::TcpListener::bind(addr)
    .await
    .map_err(|source| ServerError::Bind { addr, source })?;
  info!(addr = %listener.local_addr()?, "listening");

  axum::serve(listener, router(state))
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await?;

  info!("server stopped");
  Ok(())
}
