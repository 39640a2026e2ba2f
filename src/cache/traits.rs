//! Core traits and key layout for the persistent cache.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{SyncError, SyncResult};

/// Key holding the remote endpoint override.
pub const ENDPOINT_KEY: &str = "api_endpoint";

/// Key holding the active identity marker.
pub const ACTIVE_USER_KEY: &str = "active_user";

/// Key for an identity's record array.
pub fn data_key(identity: &str) -> String {
  format!("data_{}", identity)
}

/// Key for an identity's persisted pending queue.
pub fn pending_key(identity: &str) -> String {
  format!("pending_{}", identity)
}

/// Durable key-value storage.
///
/// Implementations must make a completed `set` visible to the next `get`,
/// including across process restarts for durable backends.
pub trait CachePort: Send + Sync {
  fn get(&self, key: &str) -> SyncResult<Option<String>>;

  fn set(&self, key: &str, value: &str) -> SyncResult<()>;

  /// Removing a missing key is not an error.
  fn remove(&self, key: &str) -> SyncResult<()>;
}

/// Typed JSON helpers on top of any [`CachePort`].
pub trait CacheJson: CachePort {
  fn get_json<T: DeserializeOwned>(&self, key: &str) -> SyncResult<Option<T>> {
    match self.get(key)? {
      Some(raw) => serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| SyncError::Cache(format!("Failed to decode cache entry '{}': {}", key, e))),
      None => Ok(None),
    }
  }

  fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> SyncResult<()> {
    let raw = serde_json::to_string(value)
      .map_err(|e| SyncError::Cache(format!("Failed to encode cache entry '{}': {}", key, e)))?;
    self.set(key, &raw)
  }
}

impl<C: CachePort + ?Sized> CacheJson for C {}
