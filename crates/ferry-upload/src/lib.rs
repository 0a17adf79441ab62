//! Ferry Upload
//!
//! Uploads the files a run produced. For each file a worker asks the run's
//! upload endpoint for a pre-signed URL, PUTs the bytes there and records the
//! returned download URL on the node's output. Once a node's files are all
//! done its output is posted in one update; once the run's files are all done
//! the registry decides whether the run has succeeded.
//!
//! Artifacts that resolve outside the engine's directories are dropped before
//! any request is made.

mod aggregate;
mod error;
mod path;
mod queue;

pub use error::UploadError;
pub use path::OutputDirs;
pub use queue::{UploadQueue, UploadTask};
