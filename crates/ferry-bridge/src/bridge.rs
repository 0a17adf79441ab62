use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use ferry_protocol::events;
use futures::Stream;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::frame::{Frame, binary_frame};

/// Capacity of the per-run broadcast. Slow SSE subscribers skip ahead.
const RUN_EVENT_CAPACITY: usize = 1024;

/// An event about one run, as seen by SSE subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct RunEvent {
  pub run_id: String,
  pub event: String,
  pub data: Value,
}

impl RunEvent {
  pub fn is_terminal(&self) -> bool {
    events::is_terminal(&self.event)
  }
}

/// The receiving side of a registered session.
#[derive(Debug)]
pub struct SessionHandle {
  pub session_id: String,
  generation: u64,
  frames: mpsc::UnboundedReceiver<Frame>,
}

impl SessionHandle {
  /// Next queued frame. `None` once the session was unregistered or replaced.
  pub async fn recv(&mut self) -> Option<Frame> {
    self.frames.recv().await
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }
}

#[derive(Debug)]
struct Session {
  generation: u64,
  sender: mpsc::UnboundedSender<Frame>,
}

/// Session registry plus per-run event broadcast.
#[derive(Debug)]
pub struct EventBridge {
  sessions: RwLock<HashMap<String, Session>>,
  runs: broadcast::Sender<RunEvent>,
  next_generation: AtomicU64,
}

impl Default for EventBridge {
  fn default() -> Self {
    Self::new()
  }
}

impl EventBridge {
  pub fn new() -> Self {
    let (runs, _) = broadcast::channel(RUN_EVENT_CAPACITY);
    Self {
      sessions: RwLock::new(HashMap::new()),
      runs,
      next_generation: AtomicU64::new(1),
    }
  }

  /// Register a session. A fresh id is generated when none is given.
  ///
  /// Reusing an id replaces the previous connection, whose handle then yields
  /// `None`. The first frame on the new handle is `status {sid}`.
  pub fn register(&self, session_id: Option<String>) -> SessionHandle {
    let session_id = session_id
      .filter(|id| !id.is_empty())
      .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
    let (sender, frames) = mpsc::unbounded_channel();

    // Receiver is still in hand
    let _ = sender.send(Frame::event(events::STATUS, json!({ "sid": session_id })));

    let replaced = self
      .write_sessions()
      .insert(session_id.clone(), Session { generation, sender });
    if replaced.is_some() {
      debug!(session_id = %session_id, "session replaced by reconnect");
    } else {
      debug!(session_id = %session_id, "session registered");
    }

    SessionHandle {
      session_id,
      generation,
      frames,
    }
  }

  /// Remove a session, unless it has since been replaced by a newer connection.
  pub fn unregister(&self, session_id: &str, generation: u64) {
    let mut sessions = self.write_sessions();
    if sessions
      .get(session_id)
      .is_some_and(|session| session.generation == generation)
    {
      sessions.remove(session_id);
      debug!(session_id, "session unregistered");
    }
  }

  pub fn is_connected(&self, session_id: &str) -> bool {
    self.read_sessions().contains_key(session_id)
  }

  pub fn session_count(&self) -> usize {
    self.read_sessions().len()
  }

  /// Send a JSON event to one session, or to all of them.
  pub fn send(&self, event: &str, data: Value, session_id: Option<&str>) {
    self.deliver(Frame::event(event, data), session_id);
  }

  /// Send a binary frame (`[u32 BE kind][payload]`) to one session, or to all.
  pub fn send_bytes(&self, kind: u32, payload: &[u8], session_id: Option<&str>) {
    self.deliver(Frame::Binary(binary_frame(kind, payload)), session_id);
  }

  /// Publish a run event to sessions and to the run's SSE subscribers.
  ///
  /// With a `session_id` (realtime runs) only that session sees it.
  pub fn publish(&self, run_id: &str, event: &str, data: Value, session_id: Option<&str>) {
    self.send(event, data.clone(), session_id);
    // No subscribers is fine
    let _ = self.runs.send(RunEvent {
      run_id: run_id.to_string(),
      event: event.to_string(),
      data,
    });
  }

  pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
    self.runs.subscribe()
  }

  /// Events for one run, ending after its terminal event.
  ///
  /// A subscriber that falls behind can miss the terminal event; after a lag
  /// `finished` is asked whether the run is over and the stream ends if so.
  pub fn bridge_to_sse<F: Fn() -> bool + Send + 'static>(
    &self,
    run_id: &str,
    finished: F,
  ) -> impl Stream<Item = RunEvent> + Send + 'static + use<F> {
    let receiver = self.subscribe();
    run_events(receiver, run_id.to_string(), finished)
  }

  fn deliver(&self, frame: Frame, session_id: Option<&str>) {
    let mut closed = Vec::new();
    {
      let sessions = self.read_sessions();
      match session_id {
        Some(id) => match sessions.get(id) {
          Some(session) => {
            if session.sender.send(frame).is_err() {
              closed.push((id.to_string(), session.generation));
            }
          }
          None => debug!(session_id = id, "dropping frame for unknown session"),
        },
        None => {
          for (id, session) in sessions.iter() {
            if session.sender.send(frame.clone()).is_err() {
              closed.push((id.clone(), session.generation));
            }
          }
        }
      }
    }

    for (id, generation) in closed {
      debug!(session_id = %id, "pruning closed session");
      self.unregister(&id, generation);
    }
  }

  fn read_sessions(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Session>> {
    self.sessions.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write_sessions(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Session>> {
    self.sessions.write().unwrap_or_else(|e| e.into_inner())
  }
}

/// Filter a broadcast receiver down to one run.
pub(crate) fn run_events(
  mut receiver: broadcast::Receiver<RunEvent>,
  run_id: String,
  finished: impl Fn() -> bool + Send + 'static,
) -> impl Stream<Item = RunEvent> + Send + 'static {
  async_stream::stream! {
    loop {
      match receiver.recv().await {
        Ok(event) => {
          if event.run_id != run_id {
            continue;
          }
          let terminal = event.is_terminal();
          yield event;
          if terminal {
            break;
          }
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(run_id = %run_id, skipped, "run event subscriber lagged");
          if finished() {
            debug!(run_id = %run_id, "run finished while lagging, closing stream");
            break;
          }
        }
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  }
}
