//! Ferry Registry
//!
//! The single source of truth for "is this run still open". Holds one
//! [`RunSnapshot`]-able record per submitted run and enforces the lifecycle:
//!
//! ```text
//! not-started ──▶ running ──▶ uploading ──▶ success
//!      │             │            │
//!      └─────────────┴────────────┴──────▶ failed | cancelled
//! ```
//!
//! Status only moves forward; terminal states are final. SUCCESS requires the
//! engine to have drained the graph and every upload to have completed.
//!
//! Every visible change is published on the
//! [`EventBridge`](ferry_bridge::EventBridge) and queued for the run's own
//! delivery task, which posts it to the status endpoint through the
//! [`StatusReporter`](ferry_reporter::StatusReporter). Realtime runs and runs
//! without an endpoint have no delivery task. Posts of one run keep their
//! order; a slow endpoint only delays its own run's posts.

mod delivery;
mod registry;
mod run;

pub use registry::{DoneOutcome, RunRegistry, UploadCompletion};
pub use run::{RunSnapshot, RunSpec, TaskId, Transition};
