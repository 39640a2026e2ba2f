//! Staleness gate deciding when a full remote re-fetch is needed.

use chrono::{DateTime, Duration, Utc};

use crate::error::SyncError;

/// Where fetched data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
  /// Fresh data from the remote
  Network,
  /// Local data, still inside the staleness window
  Cache,
  /// The remote failed; serving local data
  Offline,
}

/// Data returned from a fetch, plus metadata about its source.
#[derive(Debug, Clone)]
pub struct FetchResult<T> {
  pub data: T,
  pub source: FetchSource,
  /// When the remote was last successfully read
  pub fetched_at: Option<DateTime<Utc>>,
  /// The absorbed failure, for `Offline` results
  pub error: Option<SyncError>,
}

impl<T> FetchResult<T> {
  pub fn from_network(data: T, fetched_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: FetchSource::Network,
      fetched_at: Some(fetched_at),
      error: None,
    }
  }

  pub fn from_cache(data: T, fetched_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: FetchSource::Cache,
      fetched_at,
      error: None,
    }
  }

  pub fn offline(data: T, fetched_at: Option<DateTime<Utc>>, error: SyncError) -> Self {
    Self {
      data,
      source: FetchSource::Offline,
      fetched_at,
      error: Some(error),
    }
  }

  pub fn is_offline(&self) -> bool {
    self.source == FetchSource::Offline
  }
}

/// Staleness-gated fetch decision.
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
  /// How long before fetched data is considered stale
  stale_time: Duration,
}

impl FetchPolicy {
  pub fn new(stale_time: Duration) -> Self {
    Self { stale_time }
  }

  /// Whether a network fetch is needed.
  ///
  /// Forced fetches, an empty local collection, and a collection never
  /// fetched in this session always go to the network.
  pub fn should_fetch(
    &self,
    force: bool,
    last_fetch: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    has_local: bool,
  ) -> bool {
    if force || !has_local {
      return true;
    }
    match last_fetch {
      Some(at) => now - at >= self.stale_time,
      None => true,
    }
  }
}

impl Default for FetchPolicy {
  fn default() -> Self {
    Self::new(Duration::minutes(5))
  }
}
