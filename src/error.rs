//! Error taxonomy for the sync engine.

use thiserror::Error;

/// Errors produced by the engine.
///
/// Only `Transport` is transient; everything else points at a usage error or
/// a broken payload and is surfaced straight to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
  /// Network failure, timeout, or a non-2xx response.
  #[error("transport error: {message}")]
  Transport {
    /// HTTP status, if a response was received at all.
    status: Option<u16>,
    message: String,
  },

  /// A mutation or id-scoped request named an unknown record.
  #[error("record {id} not found")]
  NotFound { id: u64 },

  /// The remote answered with a payload of unexpected shape.
  #[error("malformed response: {0}")]
  MalformedResponse(String),

  /// A mutation was attempted while no identity is active.
  #[error("no active identity; switch to a user first")]
  IdentityRequired,

  /// The local persistent cache failed.
  #[error("cache error: {0}")]
  Cache(String),

  /// Caller input that can never succeed (bad URL, empty identity).
  #[error("invalid input: {0}")]
  InvalidInput(String),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

impl SyncError {
  pub fn transport(message: impl Into<String>) -> Self {
    Self::Transport {
      status: None,
      message: message.into(),
    }
  }

  /// Whether retrying the same request later may succeed.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Transport { .. })
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      return Self::MalformedResponse(e.to_string());
    }
    let message = if e.is_timeout() {
      format!("request timed out: {}", e)
    } else {
      e.to_string()
    };
    Self::Transport {
      status: e.status().map(|s| s.as_u16()),
      message,
    }
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    Self::Cache(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_only_transport_is_transient() {
    assert!(SyncError::transport("connection refused").is_transient());
    assert!(!SyncError::NotFound { id: 3 }.is_transient());
    assert!(!SyncError::IdentityRequired.is_transient());
    assert!(!SyncError::MalformedResponse("x".into()).is_transient());
  }

  #[test]
  fn test_display() {
    assert_eq!(SyncError::NotFound { id: 7 }.to_string(), "record 7 not found");
    let err = SyncError::Transport {
      status: Some(503),
      message: "HTTP 503: unavailable".into(),
    };
    assert_eq!(err.to_string(), "transport error: HTTP 503: unavailable");
  }

  #[test]
  fn test_sqlite_error_maps_to_cache() {
    let err = SyncError::from(rusqlite::Error::InvalidQuery);
    assert!(matches!(err, SyncError::Cache(_)));
  }
}
