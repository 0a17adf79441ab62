use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ferry_config::EngineConfig;
use ferry_engine::{Engine, EngineError, EngineEvent, EngineMessage, Job};
use ferry_protocol::{NodeMeta, RunStatus};
use ferry_registry::{RunRegistry, RunSpec, Transition};
use ferry_streaming::{RunControl, StreamingError};
use ferry_upload::UploadQueue;
use ferry_workflow::{Graph, NodeOutput};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::DriverError;
use crate::request::{SubmitRequest, SubmitResponse};

/// Turns submissions and engine events into run lifecycle changes.
///
/// Engine events are consumed one at a time by [`run`](Self::run), so the
/// events of a run are applied in the order the engine sent them.
pub struct RunLifecycleDriver {
  engine: Arc<dyn Engine>,
  registry: Arc<RunRegistry>,
  uploads: Arc<UploadQueue>,
  randomize_seeds: bool,
  forward_engine_events: bool,
}

impl RunLifecycleDriver {
  pub fn new(
    engine: Arc<dyn Engine>,
    registry: Arc<RunRegistry>,
    uploads: Arc<UploadQueue>,
    config: &EngineConfig,
  ) -> Self {
    Self {
      engine,
      registry,
      uploads,
      randomize_seeds: config.randomize_seeds,
      forward_engine_events: config.forward_engine_events,
    }
  }

  pub fn registry(&self) -> &Arc<RunRegistry> {
    &self.registry
  }

  /// Submit a control-plane job.
  ///
  /// The run is registered before the engine sees it so no early event is
  /// lost. A rejected submission leaves the run FAILED with the engine's
  /// complaint posted as an error output.
  #[instrument(skip(self, request), fields(run_id))]
  pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, DriverError> {
    let mut graph = Graph::from_value(request.graph)?;
    let filled = graph.apply_inputs(&request.inputs);
    if request.randomize_seeds.unwrap_or(self.randomize_seeds) {
      graph.randomize_seeds(&mut rand::thread_rng());
    }

    let run_id = request
      .run_id
      .unwrap_or_else(|| Uuid::new_v4().to_string());
    tracing::Span::current().record("run_id", run_id.as_str());

    let spec = RunSpec {
      run_id: run_id.clone(),
      status_endpoint: request.status_endpoint,
      upload_url_endpoint: request.upload_url_endpoint,
      auth_token: request.auth_token,
      graph_node_count: graph.node_count(),
      node_classes: graph.node_classes(),
      ..Default::default()
    };
    if !self.registry.create(spec) {
      return Err(DriverError::DuplicateRun(run_id));
    }
    debug!(nodes = graph.node_count(), inputs = filled, "run registered");

    self.start(run_id, graph, None).await
  }

  /// Submit a run on behalf of a streaming session. Its events go to that
  /// session only and nothing is posted to a control plane.
  #[instrument(skip(self, graph))]
  pub async fn submit_realtime(&self, session_id: &str, graph: Graph) -> Result<String, DriverError> {
    let run_id = Uuid::new_v4().to_string();
    let spec = RunSpec {
      run_id: run_id.clone(),
      graph_node_count: graph.node_count(),
      node_classes: graph.node_classes(),
      is_realtime: true,
      session_id: Some(session_id.to_string()),
      ..Default::default()
    };
    if !self.registry.create(spec) {
      return Err(DriverError::DuplicateRun(run_id));
    }

    self
      .start(run_id, graph, Some(session_id.to_string()))
      .await
      .map(|response| response.run_id)
  }

  /// Interrupt a run, drop its uploads and mark it CANCELLED.
  #[instrument(skip(self))]
  pub async fn cancel(&self, run_id: &str) -> Result<Transition, DriverError> {
    let Some(status) = self.registry.status(run_id) else {
      return Err(DriverError::UnknownRun(run_id.to_string()));
    };
    if status.is_terminal() {
      return Ok(Transition::Refused { current: status });
    }

    if let Err(e) = self.engine.interrupt(run_id).await {
      warn!(error = %e, "engine interrupt failed");
    }
    self.uploads.cancel_uploads_for_run(run_id);
    Ok(self.registry.transition(run_id, RunStatus::Cancelled).await)
  }

  /// Consume engine events until the channel closes or `cancel` fires.
  /// Finished runs are swept on every `sweep_interval` tick.
  pub async fn run(
    &self,
    mut receiver: mpsc::UnboundedReceiver<EngineMessage>,
    cancel: CancellationToken,
    sweep_interval: Duration,
  ) {
    info!("lifecycle driver started");
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("lifecycle driver cancelled");
          break;
        }
        message = receiver.recv() => {
          match message {
            Some(message) => self.handle_message(message).await,
            None => {
              info!("engine event channel closed");
              break;
            }
          }
        }
        _ = sweep.tick() => {
          let evicted = self.registry.sweep();
          if evicted > 0 {
            debug!(evicted, "finished runs evicted");
          }
        }
      }
    }
  }

  /// Relay one raw engine event and apply it to its run.
  #[instrument(skip(self, message), fields(event = %message.event, run_id = message.run_id()))]
  pub async fn handle_message(&self, message: EngineMessage) {
    self.relay(&message).await;

    match message.decode() {
      Ok(event) => self.handle_event(event).await,
      Err(e) => warn!(error = %e, "engine event ignored"),
    }
  }

  pub async fn handle_event(&self, event: EngineEvent) {
    match event {
      EngineEvent::ExecutionStart { run_id } => {
        self.registry.transition(&run_id, RunStatus::Running).await;
      }
      EngineEvent::Executing {
        run_id,
        node: Some(node),
      } => {
        self.registry.record_node_seen(&run_id, &node).await;
      }
      EngineEvent::Executing { run_id, node: None } => {
        self.registry.mark_done(&run_id).await;
      }
      EngineEvent::ExecutionCached { run_id, nodes } => {
        self.registry.record_nodes_cached(&run_id, &nodes);
      }
      EngineEvent::Executed {
        run_id,
        node,
        output,
      } => self.handle_output(&run_id, node, output).await,
      EngineEvent::ExecutionError { run_id, payload } => {
        warn!(run_id = %run_id, "engine reported an execution error");
        self.registry.report_error(&run_id, payload).await;
        self.registry.transition(&run_id, RunStatus::Failed).await;
      }
      EngineEvent::ExecutionInterrupted { run_id } => {
        self.uploads.cancel_uploads_for_run(&run_id);
        self.registry.transition(&run_id, RunStatus::Cancelled).await;
      }
      EngineEvent::Other { .. } => {}
    }
  }

  async fn start(
    &self,
    run_id: String,
    graph: Graph,
    client_id: Option<String>,
  ) -> Result<SubmitResponse, DriverError> {
    let job = Job {
      run_id: run_id.clone(),
      graph,
      client_id,
    };

    match self.engine.submit(job).await {
      Ok(submission) => {
        if submission.has_node_errors() {
          warn!(run_id = %run_id, "engine accepted the run with node errors");
          self
            .registry
            .report_error(
              &run_id,
              json!({
                "type": "node_errors",
                "message": "engine reported node errors",
                "node_errors": submission.node_errors,
              }),
            )
            .await;
        }
        self.registry.transition(&run_id, RunStatus::Running).await;
        info!(run_id = %run_id, number = submission.number, "run submitted");
        Ok(SubmitResponse {
          run_id,
          node_errors: submission.node_errors,
        })
      }
      Err(e) => {
        let error = match &e {
          EngineError::Rejected {
            message,
            node_errors,
          } => json!({
            "type": "prompt_rejected",
            "message": message,
            "node_errors": node_errors,
          }),
          other => json!({ "type": "submit_failed", "message": other.to_string() }),
        };
        warn!(run_id = %run_id, error = %e, "engine refused the run");
        self.registry.report_error(&run_id, error).await;
        self.registry.transition(&run_id, RunStatus::Failed).await;
        Err(e.into())
      }
    }
  }

  async fn handle_output(&self, run_id: &str, node_id: String, output: Value) {
    let output = NodeOutput::parse(output);
    let node_class = self
      .registry
      .node_class(run_id, &node_id)
      .unwrap_or_else(|| node_id.clone());

    if output.has_files() {
      let tasks = self
        .uploads
        .enqueue_output(run_id, &node_id, &node_class, &output)
        .await;
      if !tasks.is_empty() {
        debug!(run_id, node_id = %node_id, tasks = tasks.len(), "node output queued for upload");
        return;
      }
    }

    self
      .registry
      .report_output(
        run_id,
        output.data,
        Some(NodeMeta {
          node_id,
          node_class,
        }),
      )
      .await;
  }

  async fn relay(&self, message: &EngineMessage) {
    let Some(run_id) = message.run_id() else {
      self
        .registry
        .bridge()
        .send(&message.event, message.data.clone(), None);
      return;
    };

    self
      .registry
      .publish(run_id, &message.event, message.data.clone());
    if self.forward_engine_events {
      self
        .registry
        .report_event(run_id, &message.event, message.data.clone())
        .await;
    }
  }
}

#[async_trait]
impl RunControl for RunLifecycleDriver {
  async fn submit_realtime(&self, session_id: &str, graph: Graph) -> Result<String, StreamingError> {
    RunLifecycleDriver::submit_realtime(self, session_id, graph)
      .await
      .map_err(|e| StreamingError::Submit(e.to_string()))
  }

  async fn cancel(&self, run_id: &str) {
    if let Err(e) = RunLifecycleDriver::cancel(self, run_id).await {
      debug!(run_id, error = %e, "cancel skipped");
    }
  }
}
