//! Ferry Protocol
//!
//! Wire types shared with the control plane: the run status vocabulary, the
//! status/progress/output callback payloads, the signed-upload handshake, and
//! the event names emitted to live sessions.

mod status;
mod update;
mod upload;

pub mod events;

pub use status::RunStatus;
pub use update::{NodeMeta, StatusUpdate, WsEvent};
pub use upload::{SignedUpload, SignedUploadQuery};
