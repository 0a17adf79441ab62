use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use ferry_bridge::EventBridge;
use ferry_protocol::{NodeMeta, RunStatus, StatusUpdate, WsEvent, events};
use ferry_reporter::StatusReporter;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::delivery;
use crate::run::{Run, RunSnapshot, RunSpec, TaskId, Transition};

/// Result of [`RunRegistry::mark_done`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DoneOutcome {
  /// The run became SUCCESS in this call.
  pub succeeded: bool,
  pub elapsed: Option<Duration>,
}

/// Result of [`RunRegistry::complete_upload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadCompletion {
  /// The task was no longer pending (run cancelled, evicted or unknown).
  Stale,
  Pending { remaining: usize },
  /// Nothing left in flight, but the run is not (or no longer) finishing.
  Drained,
  /// The last upload of a finished run; the run is now SUCCESS.
  Succeeded,
}

/// Side effects of a run mutation.
///
/// Status updates are queued for the run's delivery task as soon as they are
/// recorded, which happens under the run's lock, so a run's posts keep the
/// order of its state changes. Bridge publishes are collected and performed
/// after the lock is released.
#[derive(Debug)]
struct Outbox {
  run_id: String,
  reports: Option<mpsc::UnboundedSender<StatusUpdate>>,
  target: Option<String>,
  publishes: Vec<(&'static str, Value)>,
}

impl Outbox {
  fn for_run(run: &Run) -> Self {
    Self {
      run_id: run.run_id.clone(),
      reports: run.reports.clone(),
      target: run
        .is_realtime
        .then(|| run.session_id.clone())
        .flatten(),
      publishes: Vec::new(),
    }
  }

  fn report(&self, update: StatusUpdate) {
    let Some(reports) = &self.reports else {
      return;
    };
    if reports.send(update).is_err() {
      debug!(run_id = %self.run_id, "status delivery closed, update dropped");
    }
  }

  fn publish(&mut self, event: &'static str, data: Value) {
    self.publishes.push((event, data));
  }

  /// `status` plus, for uploading and terminal states, the named event.
  fn status_changed(&mut self, status: RunStatus) {
    let run_id = self.run_id.clone();
    self.report(StatusUpdate::Status {
      run_id: run_id.clone(),
      status,
    });
    self.publish(
      events::STATUS,
      json!({ "run_id": run_id, "status": status }),
    );
    let named = match status {
      RunStatus::Uploading => Some(events::UPLOADING),
      RunStatus::Success => Some(events::SUCCESS),
      RunStatus::Failed => Some(events::FAILED),
      RunStatus::Cancelled => Some(events::CANCELLED),
      RunStatus::NotStarted | RunStatus::Running => None,
    };
    if let Some(event) = named {
      self.publish(event, json!({ "run_id": run_id }));
    }
  }
}

/// In-memory map of run id to run state.
///
/// Every per-run mutation happens under that run's mutex, and every network
/// side effect happens after the mutex is released. Decisions that depend on
/// more than one field ("done and drained means SUCCESS") are made inside the
/// same critical section as the mutation that made them true.
#[derive(Debug)]
pub struct RunRegistry {
  runs: RwLock<HashMap<String, Arc<Mutex<Run>>>>,
  reporter: Arc<StatusReporter>,
  bridge: Arc<EventBridge>,
  retain_finished: Duration,
}

impl RunRegistry {
  pub fn new(
    reporter: Arc<StatusReporter>,
    bridge: Arc<EventBridge>,
    retain_finished: Duration,
  ) -> Self {
    Self {
      runs: RwLock::new(HashMap::new()),
      reporter,
      bridge,
      retain_finished,
    }
  }

  pub fn bridge(&self) -> &Arc<EventBridge> {
    &self.bridge
  }

  pub fn reporter(&self) -> &Arc<StatusReporter> {
    &self.reporter
  }

  /// Register a run in NOT_STARTED. Returns `false` if the id is taken.
  ///
  /// A run with a status endpoint gets its own delivery task, so this must be
  /// called from within a tokio runtime.
  pub fn create(&self, spec: RunSpec) -> bool {
    let mut runs = self.runs.write().unwrap_or_else(|e| e.into_inner());
    if runs.contains_key(&spec.run_id) {
      warn!(run_id = %spec.run_id, "run already registered");
      return false;
    }
    debug!(run_id = %spec.run_id, nodes = spec.graph_node_count, realtime = spec.is_realtime, "run registered");
    let reports = spec
      .status_endpoint
      .clone()
      .filter(|_| !spec.is_realtime)
      .map(|endpoint| {
        delivery::spawn(
          self.reporter.clone(),
          spec.run_id.clone(),
          endpoint,
          spec.auth_token.clone(),
        )
      });
    let mut run = Run::new(spec);
    run.reports = reports;
    runs.insert(run.run_id.clone(), Arc::new(Mutex::new(run)));
    true
  }

  pub fn get(&self, run_id: &str) -> Option<RunSnapshot> {
    self.with_run(run_id, |run| run.snapshot())
  }

  pub fn status(&self, run_id: &str) -> Option<RunStatus> {
    self.with_run(run_id, |run| run.status)
  }

  pub fn contains(&self, run_id: &str) -> bool {
    self.read_runs().contains_key(run_id)
  }

  pub fn len(&self) -> usize {
    self.read_runs().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn node_class(&self, run_id: &str, node_id: &str) -> Option<String> {
    self
      .with_run(run_id, |run| run.node_classes.get(node_id).cloned())
      .flatten()
  }

  #[instrument(skip(self))]
  pub async fn transition(&self, run_id: &str, status: RunStatus) -> Transition {
    let Some((transition, outbox)) = self.with_run(run_id, |run| {
      let transition = run.apply_status(status);
      let mut outbox = Outbox::for_run(run);
      if transition.applied() {
        outbox.status_changed(status);
      }
      (transition, outbox)
    }) else {
      debug!("transition for unknown run");
      return Transition::Unknown;
    };

    match transition {
      Transition::Applied { from, to } => info!(%from, %to, "run status changed"),
      Transition::Refused { current } => debug!(%current, "transition refused"),
      Transition::Unchanged | Transition::Unknown => {}
    }
    self.flush(outbox);
    transition
  }

  /// Record a node the engine started executing and report progress when it
  /// moved. Returns the reported progress.
  pub async fn record_node_seen(&self, run_id: &str, node_id: &str) -> Option<f64> {
    let (progress, outbox) = self.with_run(run_id, |run| {
      if run.status.is_terminal() {
        return (None, None);
      }
      let Some(progress) = run.mark_seen(node_id) else {
        return (None, None);
      };
      let mut outbox = Outbox::for_run(run);
      let live_status = run.node_label(node_id);
      outbox.report(StatusUpdate::LiveStatus {
        run_id: run.run_id.clone(),
        live_status: live_status.clone(),
        progress,
      });
      outbox.publish(
        events::LIVE_STATUS,
        json!({ "run_id": run.run_id, "live_status": live_status, "progress": progress }),
      );
      (Some(progress), Some(outbox))
    })?;

    if let Some(outbox) = outbox {
      self.flush(outbox);
    }
    progress
  }

  /// Mark cached nodes as seen. Progress moves silently.
  pub fn record_nodes_cached(&self, run_id: &str, nodes: &[String]) -> Option<f64> {
    self.with_run(run_id, |run| {
      run.mark_cached(nodes.iter().map(String::as_str));
      run.progress()
    })
  }

  /// The engine has no more nodes to run. Finalizes SUCCESS if no uploads are
  /// pending, and publishes the run's elapsed time.
  #[instrument(skip(self))]
  pub async fn mark_done(&self, run_id: &str) -> Option<DoneOutcome> {
    let (outcome, outbox) = self.with_run(run_id, |run| {
      run.done = true;
      run.close_timing();

      let mut outbox = Outbox::for_run(run);
      let succeeded = !run.status.is_terminal()
        && run.can_succeed()
        && run.apply_status(RunStatus::Success).applied();
      if succeeded {
        outbox.status_changed(RunStatus::Success);
      }

      let elapsed = run.start_time.map(|start| start.elapsed());
      if let Some(elapsed) = elapsed {
        outbox.publish(
          events::ELAPSED_TIME,
          json!({ "run_id": run.run_id, "elapsed_time": elapsed.as_secs_f64() }),
        );
      }
      if !run.node_timings.is_empty() {
        info!("node timings\n{}", run.timing_table());
      }
      (DoneOutcome { succeeded, elapsed }, outbox)
    })?;

    if outcome.succeeded {
      info!("run succeeded");
    } else {
      debug!("run done, waiting on uploads");
    }
    self.flush(outbox);
    Some(outcome)
  }

  /// Register upload tasks for a run. The first batch moves the run to
  /// UPLOADING. Returns `false` if the run is unknown or already terminal.
  pub async fn add_pending_uploads(&self, run_id: &str, tasks: &[TaskId]) -> bool {
    let Some((accepted, outbox)) = self.with_run(run_id, |run| {
      if run.status.is_terminal() {
        return (false, None);
      }
      run.pending_uploads.extend(tasks.iter().copied());
      let mut outbox = Outbox::for_run(run);
      if run.apply_status(RunStatus::Uploading).applied() {
        outbox.status_changed(RunStatus::Uploading);
      }
      (true, Some(outbox))
    }) else {
      return false;
    };

    if let Some(outbox) = outbox {
      self.flush(outbox);
    }
    accepted
  }

  pub fn is_upload_pending(&self, run_id: &str, task: TaskId) -> bool {
    self
      .with_run(run_id, |run| run.pending_uploads.contains(&task))
      .unwrap_or(false)
  }

  /// Remove a finished (or abandoned) upload task. If this drains a run that
  /// the engine already finished, the run becomes SUCCESS.
  pub async fn complete_upload(&self, run_id: &str, task: TaskId) -> UploadCompletion {
    let Some((completion, outbox)) = self.with_run(run_id, |run| {
      if !run.pending_uploads.remove(&task) {
        return (UploadCompletion::Stale, None);
      }
      let remaining = run.pending_uploads.len();
      if remaining > 0 {
        return (UploadCompletion::Pending { remaining }, None);
      }

      let mut outbox = Outbox::for_run(run);
      let completion = if !run.status.is_terminal()
        && run.can_succeed()
        && run.apply_status(RunStatus::Success).applied()
      {
        outbox.status_changed(RunStatus::Success);
        UploadCompletion::Succeeded
      } else {
        run.touch_finished();
        UploadCompletion::Drained
      };
      (completion, Some(outbox))
    }) else {
      return UploadCompletion::Stale;
    };

    if completion == UploadCompletion::Succeeded {
      info!(run_id, "run succeeded after uploads drained");
    }
    if let Some(outbox) = outbox {
      self.flush(outbox);
    }
    completion
  }

  /// Forget every pending upload of a run. Returns how many were dropped.
  pub fn clear_pending_uploads(&self, run_id: &str) -> usize {
    self
      .with_run(run_id, |run| {
        let cleared = run.pending_uploads.len();
        run.pending_uploads.clear();
        run.touch_finished();
        cleared
      })
      .unwrap_or(0)
  }

  /// Post an `output_data` update.
  pub async fn report_output(&self, run_id: &str, output_data: Value, node_meta: Option<NodeMeta>) {
    self.with_run(run_id, |run| {
      Outbox::for_run(run).report(StatusUpdate::Output {
        run_id: run_id.to_string(),
        output_data,
        node_meta,
      })
    });
  }

  /// Post an error as `output_data: {error}`.
  pub async fn report_error(&self, run_id: &str, error: Value) {
    self.with_run(run_id, |run| {
      Outbox::for_run(run).report(StatusUpdate::error(run_id, error))
    });
  }

  /// Post a relayed event as `{run_id, ws_event}`.
  pub async fn report_event(&self, run_id: &str, event: &str, data: Value) {
    self.with_run(run_id, |run| {
      Outbox::for_run(run).report(StatusUpdate::Event {
        run_id: run_id.to_string(),
        ws_event: WsEvent {
          event: event.to_string(),
          data,
        },
      })
    });
  }

  /// Publish an event on the bridge, routed to the run's session when it is
  /// realtime. Unknown runs are broadcast.
  pub fn publish(&self, run_id: &str, event: &str, data: Value) {
    let session_id = self
      .with_run(run_id, |run| {
        run
          .is_realtime
          .then(|| run.session_id.clone())
          .flatten()
      })
      .flatten();
    self
      .bridge
      .publish(run_id, event, data, session_id.as_deref());
  }

  /// Evict terminal runs whose uploads drained longer ago than the retention
  /// window. Returns how many were removed.
  pub fn sweep(&self) -> usize {
    let expired: Vec<String> = self
      .read_runs()
      .iter()
      .filter(|(_, run)| {
        let run = lock(run);
        run.status.is_terminal()
          && run.pending_uploads.is_empty()
          && run
            .finished_at
            .is_some_and(|at| at.elapsed() >= self.retain_finished)
      })
      .map(|(run_id, _)| run_id.clone())
      .collect();

    if expired.is_empty() {
      return 0;
    }
    let mut runs = self.runs.write().unwrap_or_else(|e| e.into_inner());
    for run_id in &expired {
      runs.remove(run_id);
    }
    debug!(evicted = expired.len(), remaining = runs.len(), "swept finished runs");
    expired.len()
  }

  fn flush(&self, outbox: Outbox) {
    let Outbox {
      run_id,
      target,
      publishes,
      ..
    } = outbox;
    for (event, data) in publishes {
      self
        .bridge
        .publish(&run_id, event, data, target.as_deref());
    }
  }

  fn with_run<T>(&self, run_id: &str, f: impl FnOnce(&mut Run) -> T) -> Option<T> {
    let run = self.read_runs().get(run_id).cloned()?;
    let mut guard = lock(&run);
    Some(f(&mut guard))
  }

  fn read_runs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Mutex<Run>>>> {
    self.runs.read().unwrap_or_else(|e| e.into_inner())
  }
}

fn lock(run: &Mutex<Run>) -> MutexGuard<'_, Run> {
  run.lock().unwrap_or_else(|e| e.into_inner())
}
