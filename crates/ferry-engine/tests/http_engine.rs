use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use ferry_engine::{Engine, EngineError, HttpEngine, Job};
use ferry_workflow::{Graph, GraphNode};
use serde_json::{Value, json};

#[derive(Clone, Default)]
struct FakeEngine {
  received: Arc<Mutex<Vec<Value>>>,
}

async fn prompt(State(fake): State<FakeEngine>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
  fake.received.lock().unwrap().push(body.clone());
  if body["prompt"].get("bad").is_some() {
    return (
      StatusCode::BAD_REQUEST,
      Json(json!({
        "error": {"type": "invalid_prompt", "message": "Prompt outputs failed validation"},
        "node_errors": {"bad": {"errors": ["missing model"]}}
      })),
    );
  }
  (
    StatusCode::OK,
    Json(json!({"prompt_id": body["prompt_id"], "number": 4, "node_errors": {}})),
  )
}

async fn interrupt(State(fake): State<FakeEngine>, Json(body): Json<Value>) -> StatusCode {
  fake.received.lock().unwrap().push(body);
  StatusCode::OK
}

async fn spawn_engine() -> (String, FakeEngine) {
  let fake = FakeEngine::default();
  let app = Router::new()
    .route("/prompt", post(prompt))
    .route("/interrupt", post(interrupt))
    .with_state(fake.clone());
  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    axum::serve(listener, app).await.unwrap();
  });
  (format!("http://{addr}"), fake)
}

fn job(run_id: &str, node_id: &str) -> Job {
  let mut graph = Graph::default();
  graph.insert(node_id, GraphNode::new("SaveImage"));
  Job {
    run_id: run_id.to_string(),
    graph,
    client_id: Some("session-1".to_string()),
  }
}

#[tokio::test]
async fn test_submit_accepted() {
  let (url, fake) = spawn_engine().await;
  let engine = HttpEngine::new(url, Duration::from_secs(5)).unwrap();

  let submission = engine.submit(job("run-1", "9")).await.unwrap();
  assert_eq!(submission.run_id, "run-1");
  assert_eq!(submission.number, Some(4));
  assert!(!submission.has_node_errors());

  let received = fake.received.lock().unwrap();
  assert_eq!(received[0]["prompt_id"], "run-1");
  assert_eq!(received[0]["client_id"], "session-1");
  assert_eq!(received[0]["prompt"]["9"]["class_type"], "SaveImage");
}

#[tokio::test]
async fn test_submit_rejected_carries_node_errors() {
  let (url, _fake) = spawn_engine().await;
  let engine = HttpEngine::new(url, Duration::from_secs(5)).unwrap();

  match engine.submit(job("run-2", "bad")).await {
    Err(EngineError::Rejected {
      message,
      node_errors,
    }) => {
      assert_eq!(message, "Prompt outputs failed validation");
      assert_eq!(node_errors["bad"]["errors"][0], "missing model");
    }
    other => panic!("expected rejection, got {other:?}"),
  }
}

#[tokio::test]
async fn test_interrupt_names_the_run() {
  let (url, fake) = spawn_engine().await;
  let engine = HttpEngine::new(url, Duration::from_secs(5)).unwrap();

  engine.interrupt("run-3").await.unwrap();
  assert_eq!(fake.received.lock().unwrap()[0], json!({"prompt_id": "run-3"}));
}

#[tokio::test]
async fn test_unreachable_engine_gives_up_after_connect_timeout() {
  // Non-routable address: the connection attempt never completes on its own
  let engine = HttpEngine::new("http://10.255.255.1:8188", Duration::from_millis(200)).unwrap();

  let result = tokio::time::timeout(Duration::from_secs(5), engine.interrupt("run-4"))
    .await
    .expect("interrupt should not hang");
  assert!(matches!(result, Err(EngineError::Http(_))));
}
