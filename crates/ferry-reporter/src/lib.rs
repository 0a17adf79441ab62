//! Ferry Reporter
//!
//! Outbound HTTP to the control plane: status updates, signed-URL requests and
//! artifact PUTs. Every call goes through the same retry policy. The reporter
//! holds no per-run state; callers treat a [`ReportError`] as a delivery
//! failure that never changes a run's status.

mod error;
mod reporter;
mod retry;

pub use error::ReportError;
pub use reporter::{Payload, StatusReporter};
pub use retry::RetryPolicy;
