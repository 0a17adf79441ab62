use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ferry_protocol::events;
use serde_json::json;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge::EventBridge;

/// Follows the engine's log file and streams it to live sessions.
///
/// A new session gets the tail of the file as one `LOGS` event. Lines appended
/// afterwards are broadcast to every session once they are complete. A file
/// that shrinks has been rotated and is read again from the start.
#[derive(Debug, Clone)]
pub struct LogTail {
  path: PathBuf,
  poll_interval: Duration,
  snapshot_bytes: u64,
}

impl LogTail {
  pub fn new(path: impl Into<PathBuf>, poll_interval: Duration, snapshot_bytes: u64) -> Self {
    Self {
      path: path.into(),
      poll_interval,
      snapshot_bytes,
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// The last `snapshot_bytes` of the file, starting on a line boundary.
  /// `None` if the file cannot be read.
  pub async fn snapshot(&self) -> Option<String> {
    let result = async {
      let mut file = File::open(&self.path).await?;
      let len = file.metadata().await?.len();
      let start = len.saturating_sub(self.snapshot_bytes);
      let mut text = read_from(&mut file, start).await?;
      if start > 0
        && let Some(newline) = text.iter().position(|b| *b == b'\n')
      {
        text.drain(..=newline);
      }
      Ok::<_, io::Error>(text)
    }
    .await;

    match result {
      Ok(text) => Some(String::from_utf8_lossy(&text).into_owned()),
      Err(e) => {
        debug!(path = %self.path.display(), error = %e, "log file not readable");
        None
      }
    }
  }

  /// Send the snapshot to one session.
  pub async fn greet(&self, bridge: &EventBridge, session_id: &str) {
    if let Some(logs) = self.snapshot().await {
      bridge.send(events::LOGS, json!(logs), Some(session_id));
    }
  }

  /// Broadcast appended lines until `cancel` fires.
  pub async fn run(self, bridge: Arc<EventBridge>, cancel: CancellationToken) {
    // Sessions get what is already there through `greet`
    let mut offset = match tokio::fs::metadata(&self.path).await {
      Ok(metadata) => metadata.len(),
      Err(_) => 0,
    };
    let mut poll = tokio::time::interval(self.poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(path = %self.path.display(), "following log file");

    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = poll.tick() => {
          match self.read_new(&mut offset).await {
            Ok(Some(lines)) => bridge.send(events::LOGS, json!(lines), None),
            Ok(None) => {}
            Err(e) => debug!(path = %self.path.display(), error = %e, "log file not readable"),
          }
        }
      }
    }
    debug!("log tail stopped");
  }

  /// Complete lines written since `offset`, which is moved past them.
  async fn read_new(&self, offset: &mut u64) -> io::Result<Option<String>> {
    let mut file = File::open(&self.path).await?;
    let len = file.metadata().await?.len();
    if len < *offset {
      debug!(path = %self.path.display(), "log file rotated");
      *offset = 0;
    }
    if len == *offset {
      return Ok(None);
    }

    let mut appended = read_from(&mut file, *offset).await?;
    // A partial last line waits for its newline
    let Some(end) = appended.iter().rposition(|b| *b == b'\n') else {
      return Ok(None);
    };
    appended.truncate(end + 1);
    *offset += appended.len() as u64;
    Ok(Some(String::from_utf8_lossy(&appended).into_owned()))
  }
}

async fn read_from(file: &mut File, start: u64) -> io::Result<Vec<u8>> {
  file.seek(SeekFrom::Start(start)).await?;
  let mut buf = Vec::new();
  file.read_to_end(&mut buf).await?;
  Ok(buf)
}
