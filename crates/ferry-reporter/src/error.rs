/// Errors from outbound control-plane calls.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
  #[error("failed to build http client: {0}")]
  Client(#[source] reqwest::Error),

  /// Every attempt failed. `last_error` is the transport error or the status
  /// line of the final response.
  #[error("{method} {endpoint} failed after {attempts} attempts: {last_error}")]
  Exhausted {
    method: String,
    endpoint: String,
    attempts: u32,
    last_error: String,
  },

  /// The call succeeded but the body was not what we expected.
  #[error("invalid response from {endpoint}: {message}")]
  Decode { endpoint: String, message: String },
}
