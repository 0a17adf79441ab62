//! Event names emitted to WebSocket sessions and SSE streams.

pub const STATUS: &str = "status";
pub const LIVE_STATUS: &str = "live_status";
pub const UPLOADING: &str = "uploading";
pub const SUCCESS: &str = "success";
pub const FAILED: &str = "failed";
pub const CANCELLED: &str = "cancelled";
pub const OUTPUTS_UPLOADED: &str = "outputs_uploaded";
pub const ELAPSED_TIME: &str = "elapsed_time";
/// Engine log text: the file's tail on connect, then appended lines.
pub const LOGS: &str = "LOGS";
/// Sent to a streaming session when one of its messages was refused.
pub const ERROR: &str = "error";

/// Event types of binary frames.
pub mod binary {
  pub const PREVIEW_IMAGE: u32 = 1;
  pub const UNENCODED_PREVIEW_IMAGE: u32 = 2;
}

/// Events after which a run emits nothing further.
pub fn is_terminal(event: &str) -> bool {
  matches!(event, SUCCESS | FAILED | CANCELLED)
}
