//! Ferry Streaming
//!
//! Realtime sessions: a client holds a WebSocket open, streams inputs (text,
//! JSON values, image frames) and gets a fresh run for every input. The
//! previous run of the session is cancelled first.
//!
//! The manager does not know how runs are submitted; it talks to a
//! [`RunControl`] supplied by the caller, and gets workflow templates from a
//! [`TemplateSource`].

mod error;
mod input;
mod session;
mod template;

pub use error::StreamingError;
pub use input::{ClientMessage, INPUT_ID_LENGTH, ImageFormat, ImageFrame, InputValue};
pub use session::{RunControl, SessionManager};
pub use template::{HttpTemplateSource, NoTemplates, TemplateSource};
