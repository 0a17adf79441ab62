use std::time::Duration;

use ferry_config::ReporterConfig;

/// Exponential backoff: after failed attempt `n` (0-based) wait
/// `base_delay * base^n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first.
  pub max_attempts: u32,
  pub base: u32,
  pub base_delay: Duration,
}

impl RetryPolicy {
  pub fn delay(&self, attempt: u32) -> Duration {
    let factor = self.base.saturating_pow(attempt);
    self.base_delay.saturating_mul(factor)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from(&ReporterConfig::default())
  }
}

impl From<&ReporterConfig> for RetryPolicy {
  fn from(config: &ReporterConfig) -> Self {
    Self {
      max_attempts: config.max_retries.max(1),
      base: config.backoff_base,
      base_delay: config.base_delay(),
    }
  }
}
