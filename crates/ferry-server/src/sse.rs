use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use ferry_bridge::RunEvent;
use ferry_protocol::events;
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

/// Server-sent events for one run.
///
/// The first event is a `status` snapshot. A run that is already terminal
/// gets only that; otherwise the stream follows the run and ends after its
/// terminal event.
pub async fn run_events(
  State(state): State<AppState>,
  Path(run_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
  // Subscribe before the snapshot so nothing falls in between
  let registry = state.registry.clone();
  let watched = run_id.clone();
  let live = state.bridge.bridge_to_sse(&run_id, move || {
    registry
      .status(&watched)
      .is_none_or(|status| status.is_terminal())
  });
  let snapshot = state
    .registry
    .get(&run_id)
    .ok_or_else(|| ApiError::NotFound(format!("run '{run_id}' not found")))?;
  let terminal = snapshot.status.is_terminal();
  debug!(run_id = %run_id, status = %snapshot.status, "sse subscriber attached");

  let first = Event::default()
    .event(events::STATUS)
    .data(serde_json::to_string(&snapshot).unwrap_or_default());

  let stream = async_stream::stream! {
    yield Ok(first);
    if !terminal {
      let mut live = Box::pin(live);
      while let Some(event) = live.next().await {
        yield Ok(to_sse(&event));
      }
    }
  };
  Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn to_sse(event: &RunEvent) -> Event {
  Event::default()
    .event(&event.event)
    .data(serde_json::to_string(&event.data).unwrap_or_default())
}
