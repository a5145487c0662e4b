//! Error type shared by the cache, the tab controller and the sync engine.

/// Failure surfaced by the synchronization layer.
///
/// The type is `Clone` because a single in-flight request fans its result
/// out to every caller waiting on the same cache key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
  /// The request could not complete (connection refused, timeout, ...).
  #[error("Network error: {0}")]
  Network(String),
  /// The server answered with a non-2xx status. `message` is the server's
  /// own error text and is meant to be displayed as-is.
  #[error("{message}")]
  Rejected { status: u16, message: String },
  /// The payload did not have the expected shape.
  #[error("Failed to decode response: {0}")]
  Decode(String),
  #[error("Unknown tab: {0}")]
  UnknownTab(String),
  /// A fetch task was dropped before it produced a result.
  #[error("Request was cancelled")]
  Cancelled,
}

impl SyncError {
  pub fn rejected(status: u16, message: impl Into<String>) -> Self {
    Self::Rejected {
      status,
      message: message.into(),
    }
  }

  /// Whether the server itself refused the request, as opposed to the
  /// request never reaching it.
  pub fn is_rejection(&self) -> bool {
    matches!(self, Self::Rejected { .. })
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(err: reqwest::Error) -> Self {
    Self::Network(err.to_string())
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(err: serde_json::Error) -> Self {
    Self::Decode(err.to_string())
  }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
