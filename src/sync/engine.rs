//! Engine facade tying the store, the remote and the flush machinery together.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::flush::{FlushReport, FlushState, FlushTrigger, Flusher};
use super::policy::{FetchPolicy, FetchResult};
use super::scheduler::{FlushScheduler, SchedulerConfig, VisibleHook};
use crate::cache::{CachePort, ACTIVE_USER_KEY, ENDPOINT_KEY};
use crate::error::{SyncError, SyncResult};
use crate::event::StoreEvent;
use crate::record::{NewRecord, Record, RecordPatch};
use crate::remote::{parse_base_url, ImportResult, RemoteStore};
use crate::store::{EntityStore, StatusCounts};

/// Engine tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
  /// Staleness window for non-forced fetches.
  pub stale_time: chrono::Duration,
  /// Upper bound on any single remote request.
  pub request_timeout: Duration,
  pub debounce: Duration,
  pub retry_interval: Duration,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self {
      stale_time: chrono::Duration::minutes(5),
      request_timeout: Duration::from_secs(10),
      debounce: Duration::from_secs(2),
      retry_interval: Duration::from_secs(30),
    }
  }
}

/// Local-first sync engine.
///
/// Reads and mutations are served from the in-memory store immediately.
/// The remote is only contacted by fetches, explicit pushes and flushes.
pub struct SyncEngine<S: CachePort, R: RemoteStore> {
  store: Arc<EntityStore<S>>,
  remote: Arc<R>,
  flusher: Arc<Flusher<S, R>>,
  policy: FetchPolicy,
  options: EngineOptions,
}

impl<S: CachePort, R: RemoteStore> Clone for SyncEngine<S, R> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      remote: Arc::clone(&self.remote),
      flusher: Arc::clone(&self.flusher),
      policy: self.policy,
      options: self.options,
    }
  }
}

impl<S: CachePort, R: RemoteStore> SyncEngine<S, R> {
  pub fn new(cache: Arc<S>, remote: Arc<R>, options: EngineOptions) -> Self {
    let store = Arc::new(EntityStore::new(cache));
    let flusher = Arc::new(Flusher::new(
      Arc::clone(&store),
      Arc::clone(&remote),
      options.request_timeout,
    ));

    Self {
      store,
      remote,
      flusher,
      policy: FetchPolicy::new(options.stale_time),
      options,
    }
  }

  pub fn store(&self) -> &Arc<EntityStore<S>> {
    &self.store
  }

  pub fn flusher(&self) -> &Arc<Flusher<S, R>> {
    &self.flusher
  }

  pub fn options(&self) -> &EngineOptions {
    &self.options
  }

  // ==========================================================================
  // Identity
  // ==========================================================================

  /// Load the identity persisted by the last session, or `fallback`.
  ///
  /// Does not touch the network.
  pub fn restore_identity(&self, fallback: Option<&str>) -> SyncResult<Option<String>> {
    let persisted = self.store.cache().get(ACTIVE_USER_KEY).unwrap_or_else(|e| {
      warn!(error = %e, "Could not read active identity marker");
      None
    });

    match persisted.as_deref().or(fallback) {
      Some(identity) => {
        self.store.switch_identity(Some(identity))?;
        Ok(Some(identity.to_string()))
      }
      None => Ok(None),
    }
  }

  /// Switch to `identity` and force a fetch of its collection.
  ///
  /// The cached namespace is live before the fetch starts, so a failed fetch
  /// still leaves the identity's cached records readable.
  pub async fn switch_identity(&self, identity: &str) -> SyncResult<FetchResult<Vec<Record>>> {
    self.store.switch_identity(Some(identity))?;
    self.fetch_all(true).await
  }

  pub fn sign_out(&self) -> SyncResult<()> {
    self.store.switch_identity(None)
  }

  pub fn identity(&self) -> Option<String> {
    self.store.identity()
  }

  // ==========================================================================
  // Local reads and writes
  // ==========================================================================

  pub fn get_all(&self) -> Vec<Record> {
    self.store.get_all()
  }

  pub fn get(&self, id: u64) -> Option<Record> {
    self.store.get(id)
  }

  pub fn stats(&self) -> StatusCounts {
    self.store.stats()
  }

  pub fn has_pending_changes(&self) -> bool {
    self.store.has_pending_changes()
  }

  pub fn create(&self, fields: NewRecord) -> SyncResult<Record> {
    self.store.create_local(fields)
  }

  pub fn update(&self, id: u64, patch: RecordPatch) -> SyncResult<Record> {
    self.store.apply_local_mutation(id, patch)
  }

  pub fn delete(&self, id: u64) -> SyncResult<Record> {
    self.store.delete_local(id)
  }

  // ==========================================================================
  // Remote
  // ==========================================================================

  /// Staleness-gated fetch of the whole collection.
  ///
  /// Transport failures are absorbed: the local collection is returned with
  /// source `Offline` and the error attached. Only a missing identity fails.
  pub async fn fetch_all(&self, force: bool) -> SyncResult<FetchResult<Vec<Record>>> {
    if self.store.identity().is_none() {
      return Err(SyncError::IdentityRequired);
    }

    let last_fetch = self.store.last_fetch();
    if !self
      .policy
      .should_fetch(force, last_fetch, Utc::now(), !self.store.is_empty())
    {
      debug!("Local data still fresh; skipping remote fetch");
      return Ok(FetchResult::from_cache(self.store.get_all(), last_fetch));
    }

    let generation = self.store.generation();
    match self.bounded(self.remote.fetch_all()).await {
      Ok(records) => {
        self.store.apply_snapshot_for(generation, records)?;
        let fetched_at = Utc::now();
        self.store.mark_fetched(generation, fetched_at);
        Ok(FetchResult::from_network(self.store.get_all(), fetched_at))
      }
      Err(e) => {
        warn!(error = %e, "Remote fetch failed; serving local data");
        self.store.emit(StoreEvent::FetchFailed {
          message: e.to_string(),
        });
        Ok(FetchResult::offline(self.store.get_all(), last_fetch, e))
      }
    }
  }

  /// Re-read one record from the remote and merge it in.
  pub async fn refresh_record(&self, id: u64) -> SyncResult<Record> {
    if self.store.identity().is_none() {
      return Err(SyncError::IdentityRequired);
    }

    let remote = self.bounded(self.remote.fetch_one(id)).await?;
    self.store.upsert_remote(vec![remote])?;
    // A pending delete keeps the record out of the store
    self.store.get(id).ok_or(SyncError::NotFound { id })
  }

  /// Ask the remote to import records from `source_url` and merge the result.
  pub async fn import_from_source(&self, source_url: &str) -> SyncResult<ImportResult> {
    let url = Url::parse(source_url.trim())
      .map_err(|e| SyncError::InvalidInput(format!("Invalid source URL '{}': {}", source_url, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
      return Err(SyncError::InvalidInput(format!(
        "Unsupported source URL scheme '{}'",
        url.scheme()
      )));
    }
    if self.store.identity().is_none() {
      return Err(SyncError::IdentityRequired);
    }

    let result = self
      .bounded(self.remote.import_from_source(url.as_str()))
      .await?;
    let merged = self.store.upsert_remote(result.records.clone())?;
    info!(
      source = %result.source_title,
      imported = result.total_count,
      merged = merged.len(),
      "Imported records"
    );
    Ok(result)
  }

  /// Replace the remote collection with the local one.
  ///
  /// Every change queued when the push started is settled by it. Returns the
  /// number of records the remote now holds.
  pub async fn push_all(&self) -> SyncResult<usize> {
    let Some(_guard) = self.flusher.try_begin() else {
      return Err(SyncError::transport("a flush is already in progress"));
    };

    let batch = self.store.drain();
    let local = self.store.get_all();
    let stored = self.bounded(self.remote.replace_all(&local)).await?;

    for change in &batch.changes {
      self.store.confirm(&batch, change, None);
    }
    let count = stored.len();
    self.store.apply_snapshot_for(batch.generation, stored)?;
    self.store.mark_fetched(batch.generation, Utc::now());

    self.flusher.set_state(if self.store.has_pending_changes() {
      FlushState::Dirty
    } else {
      FlushState::Idle
    });
    info!(count, settled = batch.changes.len(), "Pushed local collection");
    Ok(count)
  }

  /// Flush the pending queue right away.
  pub async fn flush_now(&self) -> FlushReport {
    self.flusher.flush(FlushTrigger::SyncNow).await
  }

  async fn bounded<T>(&self, request: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
    match tokio::time::timeout(self.options.request_timeout, request).await {
      Ok(result) => result,
      Err(_) => Err(SyncError::transport(format!(
        "request timed out after {:?}",
        self.options.request_timeout
      ))),
    }
  }
}

impl<S, R> SyncEngine<S, R>
where
  S: CachePort + 'static,
  R: RemoteStore + 'static,
{
  /// Start the background flush scheduler.
  ///
  /// Returning to the foreground runs a staleness-gated fetch.
  pub fn spawn_scheduler(&self) -> FlushScheduler {
    let engine = self.clone();
    let on_visible: VisibleHook = Arc::new(move || {
      let engine = engine.clone();
      tokio::spawn(async move {
        if let Err(e) = engine.fetch_all(false).await {
          debug!(error = %e, "Skipped refresh on return");
        }
      });
    });

    FlushScheduler::spawn(
      Arc::clone(&self.flusher),
      SchedulerConfig {
        debounce: self.options.debounce,
        retry_interval: self.options.retry_interval,
      },
      Some(on_visible),
    )
  }
}

/// The persisted endpoint override, if any.
pub fn endpoint_override<S: CachePort + ?Sized>(cache: &S) -> SyncResult<Option<String>> {
  cache.get(ENDPOINT_KEY)
}

/// Persist a new endpoint override, or clear it with `None`.
///
/// Takes effect the next time a remote client is built.
pub fn set_endpoint<S: CachePort + ?Sized>(cache: &S, endpoint: Option<&str>) -> SyncResult<Option<Url>> {
  match endpoint {
    Some(raw) => {
      let url = parse_base_url(raw)?;
      cache.set(ENDPOINT_KEY, url.as_str())?;
      info!(endpoint = %url, "Saved endpoint override");
      Ok(Some(url))
    }
    None => {
      cache.remove(ENDPOINT_KEY)?;
      Ok(None)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{data_key, CacheJson, MemoryStorage};
  use crate::record::Status;
  use crate::store::PendingChange;
  use crate::sync::FetchSource;
  use crate::testing::FakeRemote;

  type Engine = SyncEngine<MemoryStorage, FakeRemote>;

  fn engine(remote: FakeRemote) -> (Engine, Arc<MemoryStorage>, Arc<FakeRemote>) {
    let cache = Arc::new(MemoryStorage::new());
    let remote = Arc::new(remote);
    let engine = SyncEngine::new(
      Arc::clone(&cache),
      Arc::clone(&remote),
      EngineOptions {
        request_timeout: Duration::from_secs(2),
        ..Default::default()
      },
    );
    (engine, cache, remote)
  }

  fn records(titles: &[&str]) -> Vec<Record> {
    titles
      .iter()
      .enumerate()
      .map(|(i, title)| Record::new(i as u64 + 1, NewRecord::titled(*title), Utc::now()))
      .collect()
  }

  #[tokio::test]
  async fn test_create_then_flush_clears_queue() {
    let (engine, _cache, remote) = engine(FakeRemote::new());
    engine.switch_identity("alice").await.unwrap();

    let record = engine
      .create(NewRecord {
        title: "Go".into(),
        status: Status::NotStarted,
        ..Default::default()
      })
      .unwrap();
    assert_eq!(record.id, 1);
    assert!(matches!(
      engine.store().pending(1),
      Some(PendingChange::Create { .. })
    ));

    let report = engine.flush_now().await;
    assert!(report.is_clean());
    assert!(!engine.has_pending_changes());
    assert_eq!(remote.records().len(), 1);
  }

  #[tokio::test]
  async fn test_rapid_status_edits_send_one_update() {
    let (engine, _cache, remote) = engine(FakeRemote::with_records(records(&["Go"])));
    engine.switch_identity("alice").await.unwrap();

    engine
      .update(1, RecordPatch::status(Status::InProgress))
      .unwrap();
    engine
      .update(1, RecordPatch::status(Status::Completed))
      .unwrap();
    assert_eq!(engine.store().pending_len(), 1);
    assert_eq!(
      engine.store().pending(1),
      Some(PendingChange::Update {
        patch: RecordPatch::status(Status::Completed)
      })
    );

    engine.flush_now().await;
    assert_eq!(remote.call_count("update"), 1);
    assert_eq!(remote.records()[0].status, Status::Completed);
  }

  #[tokio::test]
  async fn test_failed_fetch_keeps_local_collection() {
    let (engine, cache, remote) = engine(FakeRemote::with_records(records(&[
      "Go", "Rust", "Zig", "Elm", "Nim",
    ])));
    engine.switch_identity("alice").await.unwrap();
    let before = engine.get_all();
    assert_eq!(before.len(), 5);

    remote.set_offline(true);
    let result = engine.fetch_all(true).await.unwrap();
    assert!(result.is_offline());
    assert!(result.error.as_ref().is_some_and(SyncError::is_transient));
    assert_eq!(result.data, before);
    assert_eq!(engine.get_all(), before);

    let cached: Vec<Record> = cache.get_json(&data_key("alice")).unwrap().unwrap();
    assert_eq!(cached.len(), 5);
  }

  #[tokio::test(start_paused = true)]
  async fn test_hung_fetch_times_out_to_local_data() {
    let (engine, _cache, remote) = engine(FakeRemote::with_records(records(&["Go", "Rust"])));
    engine.switch_identity("alice").await.unwrap();

    remote.set_hanging(true);
    let result = engine.fetch_all(true).await.unwrap();
    assert_eq!(result.source, FetchSource::Offline);
    assert_eq!(result.data.len(), 2);
  }

  #[tokio::test]
  async fn test_offline_delete_waits_for_connectivity() {
    let (engine, _cache, remote) = engine(FakeRemote::with_records(records(&["Go", "Rust"])));
    engine.switch_identity("alice").await.unwrap();

    remote.set_offline(true);
    engine.delete(2).unwrap();
    assert!(engine.get_all().iter().all(|r| r.id != 2));

    let report = engine.flush_now().await;
    assert_eq!(report.failed.len(), 1);
    assert_eq!(engine.store().pending(2), Some(PendingChange::Delete));

    remote.set_offline(false);
    assert!(engine.flush_now().await.is_clean());
    assert!(!engine.has_pending_changes());
    assert!(remote.records().iter().all(|r| r.id != 2));
  }

  #[tokio::test]
  async fn test_switch_identity_loads_other_namespace() {
    let (engine, cache, remote) = engine(FakeRemote::with_records(records(&["Go"])));
    cache
      .set_json(&data_key("bob"), &records(&["Bob's Rust", "Bob's Zig"]))
      .unwrap();

    engine.switch_identity("alice").await.unwrap();
    engine.update(1, RecordPatch::status(Status::Completed)).unwrap();
    assert!(engine.store().last_fetch().is_some());

    remote.set_offline(true);
    let result = engine.switch_identity("bob").await.unwrap();
    assert!(result.is_offline());

    let titles: Vec<String> = engine.get_all().into_iter().map(|r| r.title).collect();
    assert_eq!(titles, vec!["Bob's Rust", "Bob's Zig"]);
    assert!(!engine.has_pending_changes());
    assert_eq!(engine.store().last_fetch(), None);
  }

  #[tokio::test]
  async fn test_fetch_within_window_hits_network_once() {
    let (engine, cache, remote) = engine(FakeRemote::with_records(records(&["Go"])));
    cache.set(ACTIVE_USER_KEY, "alice").unwrap();
    engine.restore_identity(None).unwrap();

    let first = engine.fetch_all(false).await.unwrap();
    let second = engine.fetch_all(false).await.unwrap();
    assert_eq!(first.source, FetchSource::Network);
    assert_eq!(second.source, FetchSource::Cache);
    assert_eq!(remote.call_count("fetch_all"), 1);

    engine.fetch_all(true).await.unwrap();
    assert_eq!(remote.call_count("fetch_all"), 2);
  }

  #[tokio::test]
  async fn test_fetch_requires_identity() {
    let (engine, _cache, remote) = engine(FakeRemote::new());
    assert_eq!(
      engine.fetch_all(true).await.unwrap_err(),
      SyncError::IdentityRequired
    );
    assert_eq!(remote.call_count("fetch_all"), 0);
  }

  #[tokio::test]
  async fn test_restore_identity_prefers_persisted_marker() {
    let (engine, cache, _remote) = engine(FakeRemote::new());
    assert_eq!(engine.restore_identity(Some("guest")).unwrap().as_deref(), Some("guest"));

    cache.set(ACTIVE_USER_KEY, "alice").unwrap();
    assert_eq!(engine.restore_identity(Some("guest")).unwrap().as_deref(), Some("alice"));
    assert_eq!(engine.identity().as_deref(), Some("alice"));
  }

  #[tokio::test]
  async fn test_import_merges_without_queueing() {
    let (engine, _cache, _remote) = engine(FakeRemote::new());
    engine.switch_identity("alice").await.unwrap();

    let result = engine
      .import_from_source("https://example.com/roadmap")
      .await
      .unwrap();
    assert_eq!(result.total_count, 2);
    assert!(engine.get(100).is_some());
    assert!(engine.get(101).is_some());
    assert!(!engine.has_pending_changes());
  }

  #[tokio::test]
  async fn test_import_rejects_non_http_url() {
    let (engine, _cache, remote) = engine(FakeRemote::new());
    engine.switch_identity("alice").await.unwrap();

    let err = engine.import_from_source("ftp://example.com").await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidInput(_)));
    assert_eq!(remote.call_count("import"), 0);
  }

  #[tokio::test]
  async fn test_push_all_replaces_remote_and_settles_queue() {
    let (engine, _cache, remote) = engine(FakeRemote::with_records(records(&["Go", "Rust"])));
    engine.switch_identity("alice").await.unwrap();

    engine.delete(1).unwrap();
    engine.create(NewRecord::titled("Zig")).unwrap();
    assert_eq!(engine.store().pending_len(), 2);

    let count = engine.push_all().await.unwrap();
    assert_eq!(count, 2);
    assert!(!engine.has_pending_changes());
    let titles: Vec<String> = remote.records().into_iter().map(|r| r.title).collect();
    assert_eq!(titles, vec!["Rust", "Zig"]);
    assert_eq!(engine.flusher().state(), FlushState::Idle);
  }

  #[tokio::test]
  async fn test_refresh_record_merges_remote_copy() {
    let (engine, _cache, remote) = engine(FakeRemote::with_records(records(&["Go"])));
    engine.switch_identity("alice").await.unwrap();

    let mut changed = remote.records()[0].clone();
    changed.title = "Go 1.23".into();
    remote.replace_all(&[changed]).await.unwrap();

    let refreshed = engine.refresh_record(1).await.unwrap();
    assert_eq!(refreshed.title, "Go 1.23");
    assert_eq!(engine.get(1).unwrap().title, "Go 1.23");

    assert_eq!(
      engine.refresh_record(9).await.unwrap_err(),
      SyncError::NotFound { id: 9 }
    );
  }

  #[test]
  fn test_endpoint_override_round_trip() {
    let cache = MemoryStorage::new();
    assert_eq!(endpoint_override(&cache).unwrap(), None);

    let url = set_endpoint(&cache, Some("https://tracker.example.com/api"))
      .unwrap()
      .unwrap();
    assert_eq!(url.as_str(), "https://tracker.example.com/api/");
    assert_eq!(
      endpoint_override(&cache).unwrap().as_deref(),
      Some("https://tracker.example.com/api/")
    );

    assert!(set_endpoint(&cache, Some("not a url")).is_err());
    set_endpoint(&cache, None).unwrap();
    assert_eq!(endpoint_override(&cache).unwrap(), None);
  }
}
