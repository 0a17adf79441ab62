use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use ferry_bridge::{EventBridge, Frame, RunEvent};
use ferry_config::{EngineConfig, UploadConfig, UploadFailurePolicy};
use ferry_driver::{DriverError, RunLifecycleDriver, SubmitRequest};
use ferry_engine::{ChannelNotifier, Engine, EngineError, EngineMessage, ExecutionNotifier, Job, Submission};
use ferry_protocol::RunStatus;
use ferry_registry::{RunRegistry, Transition};
use ferry_reporter::{RetryPolicy, StatusReporter};
use ferry_streaming::RunControl;
use ferry_upload::UploadQueue;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeEngine {
  reject: bool,
  jobs: Mutex<Vec<Job>>,
  interrupts: Mutex<Vec<String>>,
}

#[async_trait]
impl Engine for FakeEngine {
  async fn submit(&self, job: Job) -> Result<Submission, EngineError> {
    let run_id = job.run_id.clone();
    self.jobs.lock().unwrap().push(job);
    if self.reject {
      return Err(EngineError::Rejected {
        message: "Prompt outputs failed validation".to_string(),
        node_errors: json!({"2": {"errors": ["bad sampler"]}}),
      });
    }
    Ok(Submission {
      run_id,
      number: Some(1),
      node_errors: json!({}),
    })
  }

  async fn interrupt(&self, run_id: &str) -> Result<(), EngineError> {
    self.interrupts.lock().unwrap().push(run_id.to_string());
    Ok(())
  }
}

#[derive(Clone, Default)]
struct Plane {
  base: Arc<Mutex<String>>,
  status: Arc<Mutex<Vec<Value>>>,
  unreachable: Arc<Mutex<Vec<Value>>>,
}

async fn signed(State(plane): State<Plane>, Query(query): Query<HashMap<String, String>>) -> Json<Value> {
  let name = &query["file_name"];
  let base = plane.base.lock().unwrap().clone();
  Json(json!({
    "upload_url": format!("{base}/put/{name}"),
    "download_url": format!("https://cdn.example/{name}"),
  }))
}

async fn upload(UrlPath(_name): UrlPath<String>) -> StatusCode {
  StatusCode::OK
}

async fn status(State(plane): State<Plane>, Json(body): Json<Value>) {
  plane.status.lock().unwrap().push(body);
}

async fn unavailable(State(plane): State<Plane>, Json(body): Json<Value>) -> StatusCode {
  plane.unreachable.lock().unwrap().push(body);
  StatusCode::SERVICE_UNAVAILABLE
}

struct Harness {
  plane: Plane,
  base: String,
  engine: Arc<FakeEngine>,
  bridge: Arc<EventBridge>,
  registry: Arc<RunRegistry>,
  driver: Arc<RunLifecycleDriver>,
  dir: TempDir,
  cancel: CancellationToken,
}

impl Harness {
  async fn new(engine: FakeEngine, config: EngineConfig) -> Self {
    let retry = RetryPolicy {
      max_attempts: 1,
      base: 2,
      base_delay: Duration::from_millis(1),
    };
    Self::with_retry(engine, config, retry).await
  }

  async fn with_retry(engine: FakeEngine, config: EngineConfig, retry: RetryPolicy) -> Self {
    let plane = Plane::default();
    let app = Router::new()
      .route("/signed", get(signed))
      .route("/put/{name}", put(upload))
      .route("/status", post(status))
      .route("/down", post(unavailable))
      .with_state(plane.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    *plane.base.lock().unwrap() = base.clone();
    tokio::spawn(async move {
      axum::serve(listener, app).await.unwrap();
    });

    let reporter = Arc::new(StatusReporter::with_client(reqwest::Client::new(), retry));
    let bridge = Arc::new(EventBridge::new());
    let registry = Arc::new(RunRegistry::new(
      reporter.clone(),
      bridge.clone(),
      Duration::from_secs(300),
    ));

    let dir = TempDir::new().unwrap();
    let upload_config = UploadConfig {
      max_concurrent: 2,
      stagger_ms: 1,
      output_root: dir.path().join("output"),
      temp_root: None,
      failure_policy: UploadFailurePolicy::FailRun,
    };
    std::fs::create_dir_all(&upload_config.output_root).unwrap();

    let cancel = CancellationToken::new();
    let uploads = Arc::new(UploadQueue::start(
      &upload_config,
      registry.clone(),
      reporter,
      cancel.clone(),
    ));

    let engine = Arc::new(engine);
    let driver = Arc::new(RunLifecycleDriver::new(
      engine.clone(),
      registry.clone(),
      uploads,
      &config,
    ));

    Self {
      plane,
      base,
      engine,
      bridge,
      registry,
      driver,
      dir,
      cancel,
    }
  }

  async fn start() -> Self {
    Self::new(FakeEngine::default(), EngineConfig::default()).await
  }

  fn request(&self, run_id: &str) -> SubmitRequest {
    SubmitRequest {
      run_id: Some(run_id.to_string()),
      graph: graph(),
      status_endpoint: Some(format!("{}/status", self.base)),
      upload_url_endpoint: Some(format!("{}/signed", self.base)),
      auth_token: Some("token".to_string()),
      ..Default::default()
    }
  }

  fn posted(&self) -> Vec<Value> {
    self.plane.status.lock().unwrap().clone()
  }

  async fn wait_for_status(&self, run_id: &str, status: RunStatus) {
    for _ in 0..200 {
      if self.registry.status(run_id) == Some(status) {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} never reached {status}, is {:?}", self.registry.status(run_id));
  }

  /// Status posts are made by the run's delivery task, so they trail the
  /// state change by a moment. Returns every post seen once one matches.
  async fn wait_for_post(&self, predicate: impl Fn(&Value) -> bool) -> Vec<Value> {
    for _ in 0..200 {
      let posted = self.posted();
      if posted.iter().any(&predicate) {
        return posted;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected status post never arrived: {:?}", self.posted());
  }
}

impl Drop for Harness {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

fn graph() -> Value {
  json!({
    "1": {"class_type": "ExternalText", "inputs": {"input_id": "prompt", "default_value": ""}},
    "2": {"class_type": "KSampler", "inputs": {"seed": 5, "positive": ["1", 0]}},
    "3": {"class_type": "SaveImage", "inputs": {"images": ["2", 0]}}
  })
}

fn message(event: &str, run_id: &str, data: Value) -> EngineMessage {
  let mut data = data;
  data["prompt_id"] = json!(run_id);
  EngineMessage::new(event, data)
}

fn drain(events: &mut broadcast::Receiver<RunEvent>) -> Vec<String> {
  let mut seen = Vec::new();
  while let Ok(event) = events.try_recv() {
    seen.push(event.event);
  }
  seen
}

#[tokio::test]
async fn test_submit_applies_inputs_and_seeds() {
  let h = Harness::start().await;
  let mut request = h.request("r1");
  request.inputs.insert("prompt".to_string(), json!("a cat"));

  let response = h.driver.submit(request).await.unwrap();
  assert_eq!(response.run_id, "r1");
  assert_eq!(h.registry.status("r1"), Some(RunStatus::Running));

  let jobs = h.engine.jobs.lock().unwrap();
  let graph = &jobs[0].graph;
  assert_eq!(graph.get("1").unwrap().inputs["default_value"], json!("a cat"));
  let seed = graph.get("2").unwrap().inputs["seed"].as_u64().unwrap();
  assert!(seed >= 100_000_000_000_000);
  assert_eq!(jobs[0].client_id, None);
}

#[tokio::test]
async fn test_seed_randomization_can_be_disabled() {
  let h = Harness::start().await;
  let mut request = h.request("r1");
  request.randomize_seeds = Some(false);

  h.driver.submit(request).await.unwrap();

  let jobs = h.engine.jobs.lock().unwrap();
  assert_eq!(jobs[0].graph.get("2").unwrap().inputs["seed"], json!(5));
}

#[tokio::test]
async fn test_generated_run_id() {
  let h = Harness::start().await;
  let mut request = h.request("unused");
  request.run_id = None;

  let response = h.driver.submit(request).await.unwrap();
  assert_eq!(response.run_id.len(), 36);
  assert!(h.registry.contains(&response.run_id));
}

#[tokio::test]
async fn test_rejected_submission_fails_run() {
  let h = Harness::new(
    FakeEngine {
      reject: true,
      ..Default::default()
    },
    EngineConfig::default(),
  )
  .await;

  let err = h.driver.submit(h.request("r1")).await.unwrap_err();
  assert!(matches!(err, DriverError::Engine(EngineError::Rejected { .. })));
  assert_eq!(h.registry.status("r1"), Some(RunStatus::Failed));

  let posted = h.wait_for_post(|body| body["status"] == "failed").await;
  let error = posted
    .iter()
    .find_map(|body| body.get("output_data").and_then(|o| o.get("error")))
    .unwrap();
  assert_eq!(error["type"], "prompt_rejected");
  assert_eq!(error["node_errors"]["2"]["errors"][0], "bad sampler");
}

#[tokio::test]
async fn test_duplicate_and_invalid_submissions() {
  let h = Harness::start().await;
  h.driver.submit(h.request("r1")).await.unwrap();

  let err = h.driver.submit(h.request("r1")).await.unwrap_err();
  assert!(matches!(err, DriverError::DuplicateRun(id) if id == "r1"));

  let mut request = h.request("r2");
  request.graph = json!({});
  let err = h.driver.submit(request).await.unwrap_err();
  assert!(matches!(err, DriverError::Graph(_)));
  assert!(!h.registry.contains("r2"));
}

#[tokio::test]
async fn test_clean_run_without_files_succeeds() {
  let h = Harness::start().await;
  let mut events = h.bridge.subscribe();
  h.driver.submit(h.request("r1")).await.unwrap();

  for message in [
    message("execution_start", "r1", json!({})),
    message("execution_cached", "r1", json!({"nodes": ["1"]})),
    message("executing", "r1", json!({"node": "2"})),
    message("executing", "r1", json!({"node": "3"})),
    message("executed", "r1", json!({"node": "3", "output": {"text": ["hello"]}})),
    message("executing", "r1", json!({"node": null})),
  ] {
    h.driver.handle_message(message).await;
  }

  assert_eq!(h.registry.status("r1"), Some(RunStatus::Success));
  let seen = drain(&mut events);
  assert_eq!(seen.iter().filter(|e| *e == "success").count(), 1);
  assert!(!seen.iter().any(|e| e == "uploading"));
  assert!(seen.iter().any(|e| e == "elapsed_time"));
  // Raw engine events are relayed as well.
  assert!(seen.iter().any(|e| e == "executed"));

  let posted = h.wait_for_post(|body| body["status"] == "success").await;
  let output = posted
    .iter()
    .find(|body| body.get("output_data").is_some())
    .unwrap();
  assert_eq!(output["output_data"]["text"][0], "hello");
  assert_eq!(output["node_meta"]["node_class"], "SaveImage");
  let progress: Vec<f64> = posted
    .iter()
    .filter_map(|body| body.get("progress").and_then(Value::as_f64))
    .collect();
  assert_eq!(progress.last(), Some(&1.0));
}

#[tokio::test]
async fn test_run_with_files_succeeds_after_upload() {
  let h = Harness::start().await;
  std::fs::write(h.dir.path().join("output").join("out.png"), b"png").unwrap();
  h.driver.submit(h.request("r1")).await.unwrap();

  h.driver
    .handle_message(message(
      "executed",
      "r1",
      json!({"node": "3", "output": {"images": [{"filename": "out.png", "subfolder": "", "type": "output"}]}}),
    ))
    .await;
  h.driver
    .handle_message(message("executing", "r1", json!({"node": null})))
    .await;

  h.wait_for_status("r1", RunStatus::Success).await;
  h.wait_for_post(|body| body["status"] == "success").await;

  let posted = h.posted();
  let statuses: Vec<&str> = posted
    .iter()
    .filter_map(|body| body.get("status").and_then(Value::as_str))
    .collect();
  assert_eq!(statuses, vec!["running", "uploading", "success"]);

  let output = posted
    .iter()
    .find(|body| body.get("node_meta").is_some())
    .unwrap();
  assert_eq!(output["node_meta"]["node_id"], "3");
  assert_eq!(
    output["output_data"]["images"][0]["download_url"],
    "https://cdn.example/out.png"
  );
}

#[tokio::test]
async fn test_execution_error_is_sticky() {
  let h = Harness::start().await;
  h.driver.submit(h.request("r1")).await.unwrap();

  h.driver
    .handle_message(message(
      "execution_error",
      "r1",
      json!({"node_id": "2", "exception_message": "CUDA out of memory"}),
    ))
    .await;
  h.driver
    .handle_message(message("executing", "r1", json!({"node": null})))
    .await;

  assert_eq!(h.registry.status("r1"), Some(RunStatus::Failed));
  let posted = h.wait_for_post(|body| body["status"] == "failed").await;
  let error = posted
    .iter()
    .find_map(|body| body.get("output_data").and_then(|o| o.get("error")))
    .unwrap();
  assert_eq!(error["exception_message"], "CUDA out of memory");
  assert!(!posted.iter().any(|body| body["status"] == "success"));
}

#[tokio::test]
async fn test_interrupted_event_cancels_run() {
  let h = Harness::start().await;
  h.driver.submit(h.request("r1")).await.unwrap();

  h.driver
    .handle_message(message("execution_interrupted", "r1", json!({})))
    .await;

  assert_eq!(h.registry.status("r1"), Some(RunStatus::Cancelled));
}

#[tokio::test]
async fn test_cancel_interrupts_engine() {
  let h = Harness::start().await;
  h.driver.submit(h.request("r1")).await.unwrap();

  let transition = h.driver.cancel("r1").await.unwrap();
  assert_eq!(
    transition,
    Transition::Applied {
      from: RunStatus::Running,
      to: RunStatus::Cancelled
    }
  );
  assert_eq!(*h.engine.interrupts.lock().unwrap(), vec!["r1".to_string()]);

  // Already terminal: nothing to interrupt.
  let transition = h.driver.cancel("r1").await.unwrap();
  assert_eq!(
    transition,
    Transition::Refused {
      current: RunStatus::Cancelled
    }
  );
  assert_eq!(h.engine.interrupts.lock().unwrap().len(), 1);

  assert!(matches!(
    h.driver.cancel("ghost").await,
    Err(DriverError::UnknownRun(_))
  ));
}

#[tokio::test]
async fn test_event_loop_drives_run() {
  let h = Harness::start().await;
  h.driver.submit(h.request("r1")).await.unwrap();

  let (sender, receiver) = mpsc::unbounded_channel();
  let notifier = ChannelNotifier::new(sender);
  let driver = h.driver.clone();
  let cancel = h.cancel.clone();
  let handle = tokio::spawn(async move {
    driver
      .run(receiver, cancel, Duration::from_millis(20))
      .await;
  });

  notifier.notify(message("execution_start", "r1", json!({})));
  notifier.notify(message("executing", "r1", json!({"node": "1"})));
  notifier.notify(message("executing", "r1", json!({"node": null})));

  h.wait_for_status("r1", RunStatus::Success).await;
  h.cancel.cancel();
  handle.await.unwrap();
}

#[tokio::test]
async fn test_forwarded_engine_events() {
  let h = Harness::new(
    FakeEngine::default(),
    EngineConfig {
      forward_engine_events: true,
      ..Default::default()
    },
  )
  .await;
  h.driver.submit(h.request("r1")).await.unwrap();

  h.driver
    .handle_message(message("progress", "r1", json!({"value": 3, "max": 20})))
    .await;

  let posted = h.wait_for_post(|body| body.get("ws_event").is_some()).await;
  let forwarded = posted
    .iter()
    .find(|body| body.get("ws_event").is_some())
    .unwrap();
  assert_eq!(forwarded["run_id"], "r1");
  assert_eq!(forwarded["ws_event"]["event"], "progress");
  assert_eq!(forwarded["ws_event"]["data"]["max"], 20);
}

#[tokio::test]
async fn test_realtime_run_targets_session() {
  let h = Harness::start().await;
  let mut session = h.bridge.register(Some("s1".to_string()));

  let control: Arc<dyn RunControl> = h.driver.clone();
  let graph = ferry_workflow::Graph::from_value(graph()).unwrap();
  let run_id = control.submit_realtime("s1", graph).await.unwrap();

  let snapshot = h.registry.get(&run_id).unwrap();
  assert!(snapshot.is_realtime);
  assert_eq!(snapshot.session_id.as_deref(), Some("s1"));
  assert_eq!(
    h.engine.jobs.lock().unwrap()[0].client_id.as_deref(),
    Some("s1")
  );

  h.driver
    .handle_message(message("executing", &run_id, json!({"node": "2"})))
    .await;

  let mut events = Vec::new();
  while let Ok(Some(frame)) = tokio::time::timeout(Duration::from_millis(100), session.recv()).await {
    if let Frame::Text(text) = frame {
      let value: Value = serde_json::from_str(&text).unwrap();
      events.push(value["event"].as_str().unwrap().to_string());
    }
  }
  assert!(events.contains(&"executing".to_string()));
  assert!(events.contains(&"live_status".to_string()));

  // Realtime runs never talk to a control plane.
  assert!(h.posted().is_empty());

  control.cancel(&run_id).await;
  assert_eq!(h.registry.status(&run_id), Some(RunStatus::Cancelled));
}

#[tokio::test]
async fn test_unreachable_status_endpoint_does_not_stall_other_runs() {
  let h = Harness::with_retry(
    FakeEngine::default(),
    EngineConfig::default(),
    RetryPolicy {
      max_attempts: 4,
      base: 2,
      base_delay: Duration::from_millis(200),
    },
  )
  .await;
  let started = Instant::now();

  let mut stalled = h.request("a");
  stalled.status_endpoint = Some(format!("{}/down", h.base));
  h.driver.submit(stalled).await.unwrap();
  h.driver.submit(h.request("b")).await.unwrap();
  // Each of "a"'s updates retries for 1.4s; submitting must not wait for that
  assert!(started.elapsed() < Duration::from_millis(500));

  let (sender, receiver) = mpsc::unbounded_channel();
  let notifier = ChannelNotifier::new(sender);
  let driver = h.driver.clone();
  let cancel = h.cancel.clone();
  tokio::spawn(async move {
    driver.run(receiver, cancel, Duration::from_secs(60)).await;
  });

  for node in ["1", "2", "3"] {
    notifier.notify(message("executing", "a", json!({ "node": node })));
  }
  notifier.notify(message("executing", "b", json!({"node": "1"})));
  notifier.notify(message("executing", "b", json!({"node": null})));

  h.wait_for_status("b", RunStatus::Success).await;
  h.wait_for_post(|body| body["run_id"] == "b" && body["status"] == "success")
    .await;
  assert!(started.elapsed() < Duration::from_secs(1));
  assert_eq!(h.registry.status("a"), Some(RunStatus::Running));

  // "a" is still working through its first update
  let attempts = h.plane.unreachable.lock().unwrap().clone();
  assert!(!attempts.is_empty());
  assert!(attempts.iter().all(|body| body["run_id"] == "a" && body["status"] == "running"));
}
