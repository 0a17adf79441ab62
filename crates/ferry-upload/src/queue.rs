use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use ferry_config::{UploadConfig, UploadFailurePolicy};
use ferry_protocol::{NodeMeta, RunStatus, SignedUpload, SignedUploadQuery, events};
use ferry_registry::{RunRegistry, TaskId};
use ferry_reporter::StatusReporter;
use ferry_workflow::{ArtifactRef, NodeOutput};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::aggregate::{NodeUploads, attach_download, single_artifact_output};
use crate::error::UploadError;
use crate::path::OutputDirs;

/// One file to upload for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadTask {
  pub id: TaskId,
  pub run_id: String,
  pub node_id: Option<String>,
  pub artifact: ArtifactRef,
}

type NodeKey = (String, String);

struct Inner {
  registry: Arc<RunRegistry>,
  reporter: Arc<StatusReporter>,
  dirs: OutputDirs,
  stagger: Duration,
  failure_policy: UploadFailurePolicy,
  next_id: AtomicU64,
  nodes: Mutex<HashMap<NodeKey, NodeUploads>>,
  last_start: tokio::sync::Mutex<Option<Instant>>,
}

/// Bounded-concurrency upload queue.
///
/// Tasks wait in an unbounded FIFO drained by `max_concurrent` workers. Each
/// worker claims one task at a time, so a task is never uploaded twice.
pub struct UploadQueue {
  inner: Arc<Inner>,
  sender: mpsc::UnboundedSender<UploadTask>,
}

impl UploadQueue {
  /// Create the queue and spawn its workers. Workers stop when `cancel` fires.
  pub fn start(
    config: &UploadConfig,
    registry: Arc<RunRegistry>,
    reporter: Arc<StatusReporter>,
    cancel: CancellationToken,
  ) -> Self {
    let inner = Arc::new(Inner {
      registry,
      reporter,
      dirs: OutputDirs::from_config(config),
      stagger: config.stagger(),
      failure_policy: config.failure_policy,
      next_id: AtomicU64::new(1),
      nodes: Mutex::new(HashMap::new()),
      last_start: tokio::sync::Mutex::new(None),
    });

    let (sender, receiver) = mpsc::unbounded_channel();
    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
    let workers = config.max_concurrent.max(1);
    for worker in 0..workers {
      tokio::spawn(run_worker(
        worker,
        inner.clone(),
        receiver.clone(),
        cancel.clone(),
      ));
    }
    info!(workers, root = %config.output_root.display(), "upload queue started");

    Self { inner, sender }
  }

  /// Queue every file in a node's output.
  ///
  /// Returns the queued task ids; empty when the run has no upload endpoint,
  /// is already terminal, or every artifact was rejected. All tasks of the
  /// node are registered with the run before any worker can see them.
  #[instrument(skip(self, output), fields(files = output.artifacts.len()))]
  pub async fn enqueue_output(
    &self,
    run_id: &str,
    node_id: &str,
    node_class: &str,
    output: &NodeOutput,
  ) -> Vec<TaskId> {
    let tasks: Vec<UploadTask> = output
      .artifacts
      .iter()
      .filter_map(|artifact| self.prepare(run_id, Some(node_id), artifact))
      .collect();
    if tasks.is_empty() || !self.accepts(run_id) {
      return Vec::new();
    }

    let ids: Vec<TaskId> = tasks.iter().map(|task| task.id).collect();
    {
      let mut nodes = self.inner.lock_nodes();
      let entry = nodes
        .entry((run_id.to_string(), node_id.to_string()))
        .or_insert_with(|| NodeUploads::new(node_class.to_string(), output.data.clone(), 0));
      entry.remaining += ids.len();
    }

    if !self.inner.registry.add_pending_uploads(run_id, &ids).await {
      self
        .inner
        .lock_nodes()
        .remove(&(run_id.to_string(), node_id.to_string()));
      return Vec::new();
    }

    for task in tasks {
      if self.sender.send(task).is_err() {
        warn!("upload queue closed, task dropped");
      }
    }
    ids
  }

  /// Queue a single file. With a node id it joins that node's aggregated
  /// output; without one its output is posted on its own.
  pub async fn enqueue(&self, run_id: &str, node_id: Option<&str>, artifact: ArtifactRef) -> Option<TaskId> {
    if let Some(node_id) = node_id {
      let output = NodeOutput {
        data: json!({ artifact.kind.category(): [{
          "filename": artifact.filename,
          "subfolder": artifact.subfolder.clone().unwrap_or_default(),
          "type": artifact.folder_type,
        }]}),
        artifacts: vec![artifact],
      };
      let class = self
        .inner
        .registry
        .node_class(run_id, node_id)
        .unwrap_or_default();
      return self
        .enqueue_output(run_id, node_id, &class, &output)
        .await
        .into_iter()
        .next();
    }

    let task = self.prepare(run_id, None, &artifact)?;
    if !self.accepts(run_id) {
      return None;
    }
    let id = task.id;
    if !self.inner.registry.add_pending_uploads(run_id, &[id]).await {
      return None;
    }
    if self.sender.send(task).is_err() {
      warn!("upload queue closed, task dropped");
    }
    Some(id)
  }

  /// Forget all queued and pending uploads of a run. Queued tasks are skipped
  /// by workers; in-flight uploads finish but change nothing.
  pub fn cancel_uploads_for_run(&self, run_id: &str) -> usize {
    let cleared = self.inner.registry.clear_pending_uploads(run_id);
    self
      .inner
      .lock_nodes()
      .retain(|(run, _), _| run != run_id);
    if cleared > 0 {
      info!(run_id, cleared, "cancelled pending uploads");
    }
    cleared
  }

  fn prepare(&self, run_id: &str, node_id: Option<&str>, artifact: &ArtifactRef) -> Option<UploadTask> {
    if let Err(e) = self.inner.dirs.locate(artifact) {
      warn!(run_id, error = %e, "artifact dropped");
      return None;
    }
    Some(UploadTask {
      id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
      run_id: run_id.to_string(),
      node_id: node_id.map(str::to_string),
      artifact: artifact.clone(),
    })
  }

  /// Runs without an upload endpoint report outputs directly.
  fn accepts(&self, run_id: &str) -> bool {
    match self.inner.registry.get(run_id) {
      Some(run) => run.upload_url_endpoint.is_some() && !run.status.is_terminal(),
      None => false,
    }
  }
}

async fn run_worker(
  worker: usize,
  inner: Arc<Inner>,
  receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<UploadTask>>>,
  cancel: CancellationToken,
) {
  loop {
    let task = {
      let mut receiver = receiver.lock().await;
      tokio::select! {
        _ = cancel.cancelled() => None,
        task = receiver.recv() => task,
      }
    };
    let Some(task) = task else {
      debug!(worker, "upload worker stopped");
      break;
    };
    inner.process(task).await;
  }
}

impl Inner {
  #[instrument(name = "upload", skip(self, task), fields(run_id = %task.run_id, task_id = task.id, file = %task.artifact.relative_path()))]
  async fn process(&self, task: UploadTask) {
    if !self.registry.is_upload_pending(&task.run_id, task.id) {
      debug!("upload no longer pending, skipping");
      return;
    }

    self.wait_for_slot().await;
    let started = Instant::now();
    match self.upload(&task).await {
      Ok(download_url) => {
        let elapsed = started.elapsed();
        info!(elapsed_ms = elapsed.as_millis() as u64, "upload complete");
        self.succeeded(&task, &download_url, elapsed).await;
      }
      Err(e) if e.is_forbidden() => {
        warn!(error = %e, "artifact dropped");
        self.finish(&task).await;
      }
      Err(e) => {
        error!(error = %e, "upload failed");
        self.failed(&task, e).await;
      }
    }
  }

  /// Serialize start times so workers never start within `stagger` of each other.
  async fn wait_for_slot(&self) {
    let mut last = self.last_start.lock().await;
    if let Some(previous) = *last {
      let ready = previous + self.stagger;
      if ready > Instant::now() {
        tokio::time::sleep_until(ready.into()).await;
      }
    }
    *last = Some(Instant::now());
  }

  async fn upload(&self, task: &UploadTask) -> Result<String, UploadError> {
    let run = self
      .registry
      .get(&task.run_id)
      .ok_or_else(|| UploadError::RunGone {
        run_id: task.run_id.clone(),
      })?;
    let endpoint = run
      .upload_url_endpoint
      .as_deref()
      .ok_or_else(|| UploadError::MissingEndpoint {
        run_id: task.run_id.clone(),
      })?;

    let path = self.dirs.resolve(&task.artifact).await?;
    let io_error = |source| UploadError::Io {
      path: path.clone(),
      source,
    };
    let file_size = tokio::fs::metadata(&path).await.map_err(io_error)?.len();

    let query = SignedUploadQuery {
      file_name: task.artifact.filename.clone(),
      run_id: task.run_id.clone(),
      content_type: task.artifact.content_type.clone(),
      file_size,
    };
    let signed: SignedUpload = self
      .reporter
      .get_json(endpoint, run.auth_token.as_deref(), query_pairs(&query))
      .await?;

    let data = tokio::fs::read(&path).await.map_err(io_error)?;
    let mut headers = Vec::new();
    if signed.public_read() {
      headers.push(("x-amz-acl".to_string(), "public-read".to_string()));
    }
    self
      .reporter
      .put_bytes(
        &signed.upload_url,
        Bytes::from(data),
        &task.artifact.content_type,
        headers,
      )
      .await?;

    Ok(signed.download_url)
  }

  async fn succeeded(&self, task: &UploadTask, download_url: &str, elapsed: Duration) {
    match &task.node_id {
      Some(node_id) => {
        let flushed = {
          let mut nodes = self.lock_nodes();
          let key = (task.run_id.clone(), node_id.clone());
          let drained = match nodes.get_mut(&key) {
            Some(node) => {
              attach_download(&mut node.output, &task.artifact, download_url, elapsed);
              node.finish_one()
            }
            None => false,
          };
          if drained { nodes.remove(&key) } else { None }
        };
        if let Some(node) = flushed {
          self.flush_node(&task.run_id, node_id, node).await;
        }
      }
      None => {
        // Cancelled while in flight
        if !self.registry.is_upload_pending(&task.run_id, task.id) {
          debug!("run no longer waits for this upload, output dropped");
          return;
        }
        let output = single_artifact_output(&task.artifact, download_url, elapsed);
        self.registry.report_output(&task.run_id, output, None).await;
        self.registry.publish(
          &task.run_id,
          events::OUTPUTS_UPLOADED,
          json!({ "run_id": task.run_id }),
        );
      }
    }
    self.registry.complete_upload(&task.run_id, task.id).await;
  }

  async fn failed(&self, task: &UploadTask, error: UploadError) {
    if !self.registry.is_upload_pending(&task.run_id, task.id) {
      return;
    }
    let payload = json!({
      "type": "upload_failed",
      "message": error.to_string(),
      "filename": task.artifact.filename,
      "node_id": task.node_id,
    });
    if self.failure_policy == UploadFailurePolicy::FailRun {
      self.registry.transition(&task.run_id, RunStatus::Failed).await;
    }
    self.registry.report_error(&task.run_id, payload).await;
    self.finish(task).await;
  }

  /// Count a task as done without a download url.
  async fn finish(&self, task: &UploadTask) {
    if let Some(node_id) = &task.node_id {
      let flushed = {
        let mut nodes = self.lock_nodes();
        let key = (task.run_id.clone(), node_id.clone());
        let drained = nodes.get_mut(&key).is_some_and(|node| node.finish_one());
        if drained { nodes.remove(&key) } else { None }
      };
      if let Some(node) = flushed {
        self.flush_node(&task.run_id, node_id, node).await;
      }
    }
    self.registry.complete_upload(&task.run_id, task.id).await;
  }

  /// Post the node's aggregated output once all its uploads are done.
  async fn flush_node(&self, run_id: &str, node_id: &str, node: NodeUploads) {
    debug!(run_id, node_id, "node outputs uploaded");
    let meta = NodeMeta {
      node_id: node_id.to_string(),
      node_class: node.node_class,
    };
    self.registry.report_output(run_id, node.output, Some(meta)).await;
    self.registry.publish(
      run_id,
      events::OUTPUTS_UPLOADED,
      json!({ "run_id": run_id, "node_id": node_id }),
    );
  }

  fn lock_nodes(&self) -> MutexGuard<'_, HashMap<NodeKey, NodeUploads>> {
    self.nodes.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn query_pairs(query: &SignedUploadQuery) -> Vec<(String, String)> {
  vec![
    ("file_name".to_string(), query.file_name.clone()),
    ("run_id".to_string(), query.run_id.clone()),
    ("content_type".to_string(), query.content_type.clone()),
    ("file_size".to_string(), query.file_size.to_string()),
  ]
}
