use std::sync::Arc;

use ferry_protocol::StatusUpdate;
use ferry_reporter::StatusReporter;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Spawn the task that posts one run's status updates, in order, to its
/// status endpoint. The task ends once the returned sender is dropped and the
/// queue is drained.
///
/// Each run gets its own task, so retries against one run's endpoint never
/// hold up another run.
pub(crate) fn spawn(
  reporter: Arc<StatusReporter>,
  run_id: String,
  endpoint: String,
  token: Option<String>,
) -> mpsc::UnboundedSender<StatusUpdate> {
  let (sender, mut receiver) = mpsc::unbounded_channel::<StatusUpdate>();

  tokio::spawn(async move {
    while let Some(update) = receiver.recv().await {
      if let Err(e) = reporter
        .post_update(&endpoint, token.as_deref(), &update)
        .await
      {
        warn!(run_id = %run_id, error = %e, "status update not delivered");
      }
    }
    debug!(run_id = %run_id, "status delivery finished");
  });

  sender
}
