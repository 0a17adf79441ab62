use std::sync::Arc;

use ferry_bridge::{EventBridge, LogTail};
use ferry_driver::RunLifecycleDriver;
use ferry_engine::ExecutionNotifier;
use ferry_registry::RunRegistry;
use ferry_streaming::SessionManager;

/// Shared handles every handler works with.
#[derive(Clone)]
pub struct AppState {
  pub driver: Arc<RunLifecycleDriver>,
  pub registry: Arc<RunRegistry>,
  pub bridge: Arc<EventBridge>,
  pub sessions: Arc<SessionManager>,
  /// Where events pushed by the engine go; normally the driver's channel.
  pub notifier: Arc<dyn ExecutionNotifier>,
  /// Engine log streamed to event sessions, when configured.
  pub logs: Option<Arc<LogTail>>,
}

impl AppState {
  pub fn new(
    driver: Arc<RunLifecycleDriver>,
    sessions: Arc<SessionManager>,
    notifier: Arc<dyn ExecutionNotifier>,
  ) -> Self {
    let registry = driver.registry().clone();
    let bridge = registry.bridge().clone();
    Self {
      driver,
      registry,
      bridge,
      sessions,
      notifier,
      logs: None,
    }
  }

  pub fn with_logs(mut self, logs: Arc<LogTail>) -> Self {
    self.logs = Some(logs);
    self
  }
}
