use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ferry_protocol::{RunStatus, StatusUpdate};
use serde::Serialize;
use tokio::sync::mpsc;

/// Identifier of one upload task, unique per process.
pub type TaskId = u64;

/// Everything known about a run when it is registered.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
  pub run_id: String,
  pub status_endpoint: Option<String>,
  pub upload_url_endpoint: Option<String>,
  pub auth_token: Option<String>,
  pub graph_node_count: usize,
  pub node_classes: HashMap<String, String>,
  pub is_realtime: bool,
  pub session_id: Option<String>,
}

/// Outcome of a status change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  Applied { from: RunStatus, to: RunStatus },
  /// Already in the requested status.
  Unchanged,
  /// The change would break an invariant; the run keeps `current`.
  Refused { current: RunStatus },
  Unknown,
}

impl Transition {
  pub fn applied(&self) -> bool {
    matches!(self, Transition::Applied { .. })
  }
}

/// Mutable state of one run. Always accessed under the run's lock.
#[derive(Debug)]
pub(crate) struct Run {
  pub run_id: String,
  pub status: RunStatus,
  pub status_endpoint: Option<String>,
  pub upload_url_endpoint: Option<String>,
  pub auth_token: Option<String>,
  pub graph_node_count: usize,
  pub node_classes: HashMap<String, String>,
  pub seen_nodes: HashSet<String>,
  pub last_reported_node: Option<String>,
  pub done: bool,
  pub pending_uploads: HashSet<TaskId>,
  pub is_realtime: bool,
  pub session_id: Option<String>,
  pub start_time: Option<Instant>,
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<Instant>,
  pub node_timings: Vec<(String, Duration)>,
  /// Queue of this run's status delivery task, if it reports anywhere.
  pub reports: Option<mpsc::UnboundedSender<StatusUpdate>>,
  current_node: Option<(String, Instant)>,
}

impl Run {
  pub fn new(spec: RunSpec) -> Self {
    Self {
      run_id: spec.run_id,
      status: RunStatus::NotStarted,
      status_endpoint: spec.status_endpoint,
      upload_url_endpoint: spec.upload_url_endpoint,
      auth_token: spec.auth_token,
      graph_node_count: spec.graph_node_count,
      node_classes: spec.node_classes,
      seen_nodes: HashSet::new(),
      last_reported_node: None,
      done: false,
      pending_uploads: HashSet::new(),
      is_realtime: spec.is_realtime,
      session_id: spec.session_id,
      start_time: None,
      started_at: None,
      finished_at: None,
      node_timings: Vec::new(),
      reports: None,
      current_node: None,
    }
  }

  /// Fraction of distinct nodes seen, rounded to two decimals.
  pub fn progress(&self) -> f64 {
    if self.graph_node_count == 0 {
      return 0.0;
    }
    let ratio = self.seen_nodes.len() as f64 / self.graph_node_count as f64;
    ((ratio * 100.0).round() / 100.0).min(1.0)
  }

  pub fn apply_status(&mut self, status: RunStatus) -> Transition {
    let current = self.status;
    if current == status {
      return Transition::Unchanged;
    }
    if current.is_terminal() || status.rank() < current.rank() {
      return Transition::Refused { current };
    }
    if status == RunStatus::Success && !self.can_succeed() {
      return Transition::Refused { current };
    }

    self.status = status;
    if status == RunStatus::Running && self.start_time.is_none() {
      self.start_time = Some(Instant::now());
      self.started_at = Some(Utc::now());
    }
    self.touch_finished();
    Transition::Applied {
      from: current,
      to: status,
    }
  }

  pub fn can_succeed(&self) -> bool {
    self.done && self.pending_uploads.is_empty()
  }

  /// Stamp `finished_at` once the run is terminal and nothing is in flight.
  pub fn touch_finished(&mut self) {
    if self.status.is_terminal() && self.pending_uploads.is_empty() && self.finished_at.is_none() {
      self.finished_at = Some(Instant::now());
    }
  }

  /// Record an `executing` node. Returns the progress to report, if any.
  pub fn mark_seen(&mut self, node_id: &str) -> Option<f64> {
    self.track_timing(node_id);

    let is_new = self.seen_nodes.insert(node_id.to_string());
    if !is_new || self.last_reported_node.as_deref() == Some(node_id) {
      return None;
    }
    self.last_reported_node = Some(node_id.to_string());
    Some(self.progress())
  }

  pub fn mark_cached<'a>(&mut self, nodes: impl IntoIterator<Item = &'a str>) {
    for node in nodes {
      self.seen_nodes.insert(node.to_string());
    }
  }

  /// Display label for live status: the node's class, else its id.
  pub fn node_label(&self, node_id: &str) -> String {
    self
      .node_classes
      .get(node_id)
      .cloned()
      .unwrap_or_else(|| node_id.to_string())
  }

  fn track_timing(&mut self, node_id: &str) {
    if self
      .current_node
      .as_ref()
      .is_some_and(|(current, _)| current == node_id)
    {
      return;
    }
    self.close_timing();
    self.current_node = Some((node_id.to_string(), Instant::now()));
  }

  pub fn close_timing(&mut self) {
    if let Some((node, started)) = self.current_node.take() {
      self.node_timings.push((node, started.elapsed()));
    }
  }

  /// Node timings as a plain-text table, slowest first.
  pub fn timing_table(&self) -> String {
    let mut rows: Vec<_> = self.node_timings.iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1));
    let mut table = format!("{:<8} {:<32} {:>10}", "node", "class", "seconds");
    for (node, elapsed) in rows {
      let class = self.node_classes.get(node).map(String::as_str).unwrap_or("?");
      table.push_str(&format!(
        "\n{:<8} {:<32} {:>10.3}",
        node,
        class,
        elapsed.as_secs_f64()
      ));
    }
    table
  }

  pub fn snapshot(&self) -> RunSnapshot {
    RunSnapshot {
      run_id: self.run_id.clone(),
      status: self.status,
      progress: self.progress(),
      graph_node_count: self.graph_node_count,
      seen_nodes: self.seen_nodes.len(),
      done: self.done,
      pending_uploads: self.pending_uploads.len(),
      is_realtime: self.is_realtime,
      session_id: self.session_id.clone(),
      status_endpoint: self.status_endpoint.clone(),
      upload_url_endpoint: self.upload_url_endpoint.clone(),
      auth_token: self.auth_token.clone(),
      started_at: self.started_at,
    }
  }
}

/// A point-in-time copy of a run's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
  pub run_id: String,
  pub status: RunStatus,
  pub progress: f64,
  pub graph_node_count: usize,
  pub seen_nodes: usize,
  pub done: bool,
  pub pending_uploads: usize,
  pub is_realtime: bool,
  pub session_id: Option<String>,
  #[serde(skip)]
  pub status_endpoint: Option<String>,
  #[serde(skip)]
  pub upload_url_endpoint: Option<String>,
  #[serde(skip)]
  pub auth_token: Option<String>,
  pub started_at: Option<DateTime<Utc>>,
}
