use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use ferry_workflow::Graph;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::StreamingError;
use crate::input::{ClientMessage, ImageFrame, InputValue};
use crate::template::TemplateSource;

/// Submits and cancels the runs a streaming session drives.
#[async_trait]
pub trait RunControl: Send + Sync {
  /// Submit a realtime run owned by `session_id`. Returns its run id.
  async fn submit_realtime(&self, session_id: &str, graph: Graph) -> Result<String, StreamingError>;

  async fn cancel(&self, run_id: &str);
}

#[derive(Debug, Default)]
struct StreamingSession {
  workflow_id: Option<String>,
  template: Option<Graph>,
  inputs: HashMap<String, InputValue>,
  running: Vec<String>,
}

/// Owns every open streaming session.
///
/// Each accepted input cancels the session's in-flight run and submits a new
/// one built from the template and all inputs received so far. The session's
/// lock is held across cancel and submit, so two inputs never race to start
/// runs.
pub struct SessionManager {
  sessions: RwLock<HashMap<String, Arc<Mutex<StreamingSession>>>>,
  control: Arc<dyn RunControl>,
  templates: Arc<dyn TemplateSource>,
}

impl SessionManager {
  pub fn new(control: Arc<dyn RunControl>, templates: Arc<dyn TemplateSource>) -> Self {
    Self {
      sessions: RwLock::new(HashMap::new()),
      control,
      templates,
    }
  }

  /// Open a session, loading its template when a workflow id is given.
  /// Reopening an id closes the previous session first.
  #[instrument(skip(self))]
  pub async fn open(&self, session_id: &str, workflow_id: Option<&str>) -> Result<(), StreamingError> {
    let template = match workflow_id {
      Some(workflow_id) => Some(self.templates.fetch(workflow_id).await?),
      None => None,
    };

    let session = StreamingSession {
      workflow_id: workflow_id.map(str::to_string),
      template,
      ..Default::default()
    };
    let previous = self
      .sessions
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .insert(session_id.to_string(), Arc::new(Mutex::new(session)));

    if let Some(previous) = previous {
      self.cancel_all(&mut *previous.lock().await).await;
    }
    info!("streaming session opened");
    Ok(())
  }

  /// Handle a JSON text message. Returns the id of the run it started, if any.
  pub async fn handle_text(&self, session_id: &str, text: &str) -> Result<Option<String>, StreamingError> {
    let message = ClientMessage::parse(text)?;
    let session = self.session(session_id)?;
    let mut session = session.lock().await;

    match message {
      ClientMessage::Input { inputs } => {
        debug!(session_id, slots = inputs.len(), "inputs received");
        for (slot, value) in inputs {
          session.inputs.insert(slot, InputValue::from_json(value));
        }
      }
      ClientMessage::Template { graph } => {
        debug!(session_id, "template replaced");
        session.template = Some(Graph::from_value(graph)?);
      }
    }

    self.resubmit(session_id, &mut session).await
  }

  /// Handle a binary image frame. Returns the id of the run it started, if any.
  pub async fn handle_binary(&self, session_id: &str, frame: &[u8]) -> Result<Option<String>, StreamingError> {
    let frame = ImageFrame::parse(frame)?;
    let session = self.session(session_id)?;
    let mut session = session.lock().await;

    debug!(session_id, input_id = %frame.input_id, kind = frame.kind, "image input received");
    session.inputs.insert(frame.input_id, frame.value);
    self.resubmit(session_id, &mut session).await
  }

  /// Close a session and cancel whatever it is running.
  #[instrument(skip(self))]
  pub async fn close(&self, session_id: &str) {
    let removed = self
      .sessions
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .remove(session_id);
    if let Some(session) = removed {
      let mut session = session.lock().await;
      self.cancel_all(&mut session).await;
      info!(workflow_id = ?session.workflow_id, "streaming session closed");
    }
  }

  pub fn contains(&self, session_id: &str) -> bool {
    self
      .sessions
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .contains_key(session_id)
  }

  /// Runs the session currently considers in flight.
  pub async fn running(&self, session_id: &str) -> Vec<String> {
    match self.session(session_id) {
      Ok(session) => session.lock().await.running.clone(),
      Err(_) => Vec::new(),
    }
  }

  fn session(&self, session_id: &str) -> Result<Arc<Mutex<StreamingSession>>, StreamingError> {
    self
      .sessions
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .get(session_id)
      .cloned()
      .ok_or_else(|| StreamingError::UnknownSession(session_id.to_string()))
  }

  async fn resubmit(
    &self,
    session_id: &str,
    session: &mut StreamingSession,
  ) -> Result<Option<String>, StreamingError> {
    let Some(template) = &session.template else {
      debug!(session_id, "no template yet, inputs buffered");
      return Ok(None);
    };

    let mut graph = template.clone();
    let inputs: HashMap<String, Value> = session
      .inputs
      .iter()
      .map(|(slot, value)| (slot.clone(), value.to_graph_value()))
      .collect();
    graph.apply_inputs(&inputs);
    graph.set_client_id(session_id);

    self.cancel_all(session).await;
    let run_id = self.control.submit_realtime(session_id, graph).await?;
    session.running.push(run_id.clone());
    Ok(Some(run_id))
  }

  async fn cancel_all(&self, session: &mut StreamingSession) {
    for run_id in session.running.drain(..) {
      self.control.cancel(&run_id).await;
    }
  }
}
