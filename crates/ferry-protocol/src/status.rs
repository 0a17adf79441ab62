use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
  #[default]
  NotStarted,
  Running,
  Uploading,
  Success,
  Failed,
  Cancelled,
}

impl RunStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      RunStatus::NotStarted => "not-started",
      RunStatus::Running => "running",
      RunStatus::Uploading => "uploading",
      RunStatus::Success => "success",
      RunStatus::Failed => "failed",
      RunStatus::Cancelled => "cancelled",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled
    )
  }

  /// Position in the forward-only lifecycle. All terminal states share a rank.
  pub fn rank(&self) -> u8 {
    match self {
      RunStatus::NotStarted => 0,
      RunStatus::Running => 1,
      RunStatus::Uploading => 2,
      RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled => 3,
    }
  }
}

impl fmt::Display for RunStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_wire_names() {
    assert_eq!(
      serde_json::to_value(RunStatus::NotStarted).unwrap(),
      "not-started"
    );
    assert_eq!(serde_json::to_value(RunStatus::Uploading).unwrap(), "uploading");
    let parsed: RunStatus = serde_json::from_str("\"cancelled\"").unwrap();
    assert_eq!(parsed, RunStatus::Cancelled);
  }

  #[test]
  fn test_terminal_rank() {
    assert!(RunStatus::Failed.is_terminal());
    assert!(!RunStatus::Uploading.is_terminal());
    assert!(RunStatus::Running.rank() < RunStatus::Uploading.rank());
    assert_eq!(RunStatus::Success.rank(), RunStatus::Cancelled.rank());
  }
}
