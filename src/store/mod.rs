//! In-memory authoritative record collection backed by the persistent cache.
//!
//! Every mutation runs under one lock: the record change, the cache
//! write-through and the pending-queue entry land together, so the next read
//! observes all three. Change notifications go out on the store's
//! [`EventBus`] after the lock is released.

pub mod queue;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::{data_key, pending_key, CacheJson, CachePort, ACTIVE_USER_KEY};
use crate::error::{SyncError, SyncResult};
use crate::event::{EventBus, StoreEvent};
use crate::record::{NewRecord, Record, RecordPatch, Status};

pub use queue::{AckOutcome, DrainedChange, PendingChange, PendingQueue};

/// Everything owned by the active identity.
#[derive(Debug, Default)]
struct StoreState {
  identity: Option<String>,
  /// Bumped on every identity switch so late flush results can be routed.
  generation: u64,
  records: Vec<Record>,
  queue: PendingQueue,
  last_fetch: Option<DateTime<Utc>>,
  /// Provisional ids moved since the last drain, old id to current id.
  moved: HashMap<u64, u64>,
}

/// Pending changes drained for one flush, tagged with their owner.
#[derive(Debug, Clone)]
pub struct PendingBatch {
  pub generation: u64,
  pub identity: Option<String>,
  pub changes: Vec<DrainedChange>,
}

impl PendingBatch {
  pub fn is_empty(&self) -> bool {
    self.changes.is_empty()
  }
}

/// Result of applying a remote snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotOutcome {
  /// Records held after the snapshot was applied.
  pub count: usize,
  /// Pending changes re-applied on top of the snapshot.
  pub reapplied: usize,
  /// Whether the local collection actually changed.
  pub changed: bool,
}

/// Record counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
  pub not_started: usize,
  pub in_progress: usize,
  pub completed: usize,
}

impl StatusCounts {
  pub fn total(&self) -> usize {
    self.not_started + self.in_progress + self.completed
  }

  /// Share of completed records, 0 to 100.
  pub fn completion_percent(&self) -> u8 {
    match self.total() {
      0 => 0,
      total => ((self.completed * 100) / total) as u8,
    }
  }
}

/// Authoritative working copy of the record collection.
pub struct EntityStore<S: CachePort> {
  cache: Arc<S>,
  state: Mutex<StoreState>,
  events: EventBus,
}

impl<S: CachePort> EntityStore<S> {
  /// Create a store with no active identity.
  pub fn new(cache: Arc<S>) -> Self {
    Self {
      cache,
      state: Mutex::new(StoreState::default()),
      events: EventBus::default(),
    }
  }

  /// The underlying cache port.
  pub fn cache(&self) -> &Arc<S> {
    &self.cache
  }

  /// Subscribe to change notifications.
  pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
    self.events.subscribe()
  }

  pub(crate) fn emit(&self, event: StoreEvent) {
    self.events.emit(event);
  }

  fn state(&self) -> MutexGuard<'_, StoreState> {
    // Every critical section leaves the state consistent, so a panic
    // elsewhere does not invalidate it.
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  // ==========================================================================
  // Identity
  // ==========================================================================

  /// Tear down all state and rebuild it from `identity`'s cache namespace.
  ///
  /// `None` signs out: the store is left empty and rejects mutations.
  pub fn switch_identity(&self, identity: Option<&str>) -> SyncResult<()> {
    let identity = match identity.map(str::trim) {
      Some("") => return Err(SyncError::InvalidInput("identity must not be empty".into())),
      other => other.map(String::from),
    };

    let mut state = self.state();
    let generation = state.generation + 1;
    *state = match &identity {
      Some(id) => StoreState::load(&*self.cache, id),
      None => StoreState::default(),
    };
    state.generation = generation;

    let marker = match &identity {
      Some(id) => self.cache.set(ACTIVE_USER_KEY, id),
      None => self.cache.remove(ACTIVE_USER_KEY),
    };
    if let Err(e) = marker {
      warn!(error = %e, "Failed to persist active identity marker");
    }

    info!(
      identity = identity.as_deref().unwrap_or("<none>"),
      records = state.records.len(),
      pending = state.queue.len(),
      "Switched identity"
    );
    drop(state);

    self.emit(StoreEvent::IdentityChanged { identity });
    Ok(())
  }

  pub fn identity(&self) -> Option<String> {
    self.state().identity.clone()
  }

  pub fn generation(&self) -> u64 {
    self.state().generation
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// Snapshot of every record.
  pub fn get_all(&self) -> Vec<Record> {
    self.state().records.clone()
  }

  pub fn get(&self, id: u64) -> Option<Record> {
    self.state().records.iter().find(|r| r.id == id).cloned()
  }

  /// Records matching `predicate`, in collection order.
  pub fn query<F>(&self, predicate: F) -> Vec<Record>
  where
    F: Fn(&Record) -> bool,
  {
    self
      .state()
      .records
      .iter()
      .filter(|r| predicate(r))
      .cloned()
      .collect()
  }

  pub fn stats(&self) -> StatusCounts {
    let state = self.state();
    let mut counts = StatusCounts::default();
    for record in &state.records {
      match record.status {
        Status::NotStarted => counts.not_started += 1,
        Status::InProgress => counts.in_progress += 1,
        Status::Completed => counts.completed += 1,
      }
    }
    counts
  }

  pub fn len(&self) -> usize {
    self.state().records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.state().records.is_empty()
  }

  pub fn last_fetch(&self) -> Option<DateTime<Utc>> {
    self.state().last_fetch
  }

  // ==========================================================================
  // Local mutations
  // ==========================================================================

  /// Merge `patch` into record `id`, persist it, and queue the diff.
  pub fn apply_local_mutation(&self, id: u64, patch: RecordPatch) -> SyncResult<Record> {
    let mut state = self.state();
    if state.identity.is_none() {
      return Err(SyncError::IdentityRequired);
    }

    let record = state
      .records
      .iter_mut()
      .find(|r| r.id == id)
      .ok_or(SyncError::NotFound { id })?;

    if patch.is_empty() {
      return Ok(record.clone());
    }

    patch.apply_to(record);
    record.touch(Utc::now());
    let updated = record.clone();

    state.queue.record(id, PendingChange::Update { patch });
    self.persist_records(&state);
    self.persist_queue(&state);
    drop(state);

    debug!(id, "Applied local mutation");
    self.emit(StoreEvent::Changed { ids: vec![id] });
    Ok(updated)
  }

  /// Add a record under a provisional id and queue its creation.
  pub fn create_local(&self, fields: NewRecord) -> SyncResult<Record> {
    if fields.title.trim().is_empty() {
      return Err(SyncError::InvalidInput("title must not be empty".into()));
    }

    let mut state = self.state();
    if state.identity.is_none() {
      return Err(SyncError::IdentityRequired);
    }

    let record = Record::new(state.next_id(), fields, Utc::now());
    state.records.push(record.clone());
    state.queue.record(
      record.id,
      PendingChange::Create {
        record: record.clone(),
      },
    );
    self.persist_records(&state);
    self.persist_queue(&state);
    drop(state);

    debug!(id = record.id, "Created local record");
    self.emit(StoreEvent::Changed {
      ids: vec![record.id],
    });
    Ok(record)
  }

  /// Remove a record and queue a deletion marker.
  pub fn delete_local(&self, id: u64) -> SyncResult<Record> {
    let mut state = self.state();
    if state.identity.is_none() {
      return Err(SyncError::IdentityRequired);
    }

    let position = state
      .records
      .iter()
      .position(|r| r.id == id)
      .ok_or(SyncError::NotFound { id })?;
    let removed = state.records.remove(position);

    state.queue.record(id, PendingChange::Delete);
    self.persist_records(&state);
    self.persist_queue(&state);
    drop(state);

    debug!(id, "Deleted local record");
    self.emit(StoreEvent::Changed { ids: vec![id] });
    Ok(removed)
  }

  // ==========================================================================
  // Remote data
  // ==========================================================================

  /// Replace the collection with a remote snapshot, re-applying pending changes.
  ///
  /// Records without pending changes take the remote version. Pending
  /// updates are replayed over the remote copy, pending creates are kept,
  /// and pending deletes stay deleted.
  pub fn apply_remote_snapshot(&self, records: Vec<Record>) -> SyncResult<SnapshotOutcome> {
    self
      .apply_snapshot(None, records)
      .map(|outcome| outcome.unwrap_or_default())
  }

  /// Like [`apply_remote_snapshot`](Self::apply_remote_snapshot), but only if
  /// the identity generation that requested the snapshot is still active.
  pub fn apply_snapshot_for(
    &self,
    generation: u64,
    records: Vec<Record>,
  ) -> SyncResult<Option<SnapshotOutcome>> {
    self.apply_snapshot(Some(generation), records)
  }

  fn apply_snapshot(
    &self,
    generation: Option<u64>,
    records: Vec<Record>,
  ) -> SyncResult<Option<SnapshotOutcome>> {
    let mut state = self.state();
    if state.identity.is_none() {
      return Err(SyncError::IdentityRequired);
    }
    if generation.is_some_and(|g| g != state.generation) {
      debug!("Discarding snapshot requested by a previous identity");
      return Ok(None);
    }

    let moved = state.make_room_for(&records);
    if moved {
      self.persist_queue(&state);
    }

    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(records.len());
    let mut reapplied = 0;

    for remote in records {
      if !seen.insert(remote.id) {
        warn!(id = remote.id, "Remote snapshot repeats an id; keeping the first");
        continue;
      }
      if state.queue.contains(remote.id) {
        reapplied += 1;
      }
      if let Some(record) = state.overlay_pending(remote) {
        merged.push(record);
      }
    }

    // Pending records the remote does not know about yet
    let missing: Vec<u64> = state.queue.ids().filter(|id| !seen.contains(id)).collect();
    for id in missing {
      let local = match state.queue.get(id) {
        Some(PendingChange::Create { record }) => Some(record.clone()),
        Some(PendingChange::Update { .. }) => state.records.iter().find(|r| r.id == id).cloned(),
        _ => None,
      };
      if let Some(local) = local {
        merged.push(local);
        reapplied += 1;
      }
    }

    let changed = moved || snapshot_digest(&merged) != snapshot_digest(&state.records);
    let count = merged.len();
    if changed {
      state.records = merged;
      self.persist_records(&state);
    }
    drop(state);

    info!(count, reapplied, changed, "Applied remote snapshot");
    if changed {
      self.emit(StoreEvent::Replaced { count });
    }

    Ok(Some(SnapshotOutcome {
      count,
      reapplied,
      changed,
    }))
  }

  /// Merge authoritative remote records without queueing anything.
  pub fn upsert_remote(&self, records: Vec<Record>) -> SyncResult<Vec<u64>> {
    let mut state = self.state();
    if state.identity.is_none() {
      return Err(SyncError::IdentityRequired);
    }

    if state.make_room_for(&records) {
      self.persist_queue(&state);
    }

    let mut ids = Vec::with_capacity(records.len());
    for remote in records {
      let id = remote.id;
      let position = state.records.iter().position(|r| r.id == id);
      match (state.overlay_pending(remote), position) {
        (Some(record), Some(pos)) => state.records[pos] = record,
        (Some(record), None) => state.records.push(record),
        (None, _) => continue,
      }
      ids.push(id);
    }

    if !ids.is_empty() {
      self.persist_records(&state);
    }
    drop(state);

    if !ids.is_empty() {
      self.emit(StoreEvent::Merged { ids: ids.clone() });
    }
    Ok(ids)
  }

  /// Record a successful fetch for the identity generation that issued it.
  pub fn mark_fetched(&self, generation: u64, at: DateTime<Utc>) {
    let mut state = self.state();
    if state.generation == generation {
      state.last_fetch = Some(at);
    }
  }

  // ==========================================================================
  // Pending queue
  // ==========================================================================

  pub fn has_pending_changes(&self) -> bool {
    !self.state().queue.is_empty()
  }

  pub fn pending_len(&self) -> usize {
    self.state().queue.len()
  }

  pub fn pending(&self, id: u64) -> Option<PendingChange> {
    self.state().queue.get(id).cloned()
  }

  /// Snapshot the queue for a flush. Entries stay queued until confirmed.
  pub fn drain(&self) -> PendingBatch {
    let mut state = self.state();
    // Anything sent before this drain has settled
    state.moved.clear();
    PendingBatch {
      generation: state.generation,
      identity: state.identity.clone(),
      changes: state.queue.drain(),
    }
  }

  /// Drop the entry for `id` unconditionally. Acking an absent id is a no-op.
  pub fn ack(&self, id: u64) -> bool {
    let mut state = self.state();
    let removed = state.queue.ack(id);
    if removed {
      self.persist_queue(&state);
    }
    removed
  }

  /// Settle one change the remote accepted.
  ///
  /// `remote` is the record the remote returned for a create. Results that
  /// arrive after an identity switch are applied to the originating
  /// identity's persisted namespace instead of the live state.
  pub fn confirm(&self, batch: &PendingBatch, sent: &DrainedChange, remote: Option<&Record>) -> AckOutcome {
    let mut state = self.state();
    if state.generation == batch.generation {
      let (outcome, records_changed) = state.confirm(sent, remote);
      if records_changed {
        self.persist_records(&state);
      }
      self.persist_queue(&state);
      return outcome;
    }
    drop(state);

    let Some(identity) = batch.identity.as_deref() else {
      return AckOutcome::Missing;
    };
    debug!(id = sent.id, identity, "Confirming change for inactive identity");
    let mut detached = StoreState::load(&*self.cache, identity);
    let (outcome, records_changed) = detached.confirm(sent, remote);
    if records_changed {
      self.persist_records(&detached);
    }
    self.persist_queue(&detached);
    outcome
  }

  /// Turn a queued update into a create of the full local record.
  ///
  /// Used when the remote no longer knows the record being updated.
  pub fn promote_to_create(&self, generation: u64, id: u64) -> bool {
    let mut state = self.state();
    if state.generation != generation {
      return false;
    }
    if !matches!(state.queue.get(id), Some(PendingChange::Update { .. })) {
      return false;
    }
    let Some(record) = state.records.iter().find(|r| r.id == id).cloned() else {
      return false;
    };

    state.queue.promote_to_create(id, record);
    self.persist_queue(&state);
    true
  }

  // ==========================================================================
  // Write-through
  // ==========================================================================

  fn persist_records(&self, state: &StoreState) {
    if let Some(identity) = &state.identity {
      if let Err(e) = self.cache.set_json(&data_key(identity), &state.records) {
        warn!(identity, error = %e, "Failed to write records to cache");
      }
    }
  }

  fn persist_queue(&self, state: &StoreState) {
    if let Some(identity) = &state.identity {
      if let Err(e) = self.cache.set_json(&pending_key(identity), &state.queue) {
        warn!(identity, error = %e, "Failed to write pending queue to cache");
      }
    }
  }
}

impl StoreState {
  /// Load an identity's namespace. Unreadable entries start empty.
  fn load<S: CachePort + ?Sized>(cache: &S, identity: &str) -> Self {
    let records = cache
      .get_json::<Vec<Record>>(&data_key(identity))
      .unwrap_or_else(|e| {
        warn!(identity, error = %e, "Discarding unreadable cached records");
        None
      })
      .unwrap_or_default();

    let queue = cache
      .get_json::<PendingQueue>(&pending_key(identity))
      .unwrap_or_else(|e| {
        warn!(identity, error = %e, "Discarding unreadable pending queue");
        None
      })
      .unwrap_or_default();

    Self {
      identity: Some(identity.to_string()),
      records,
      queue,
      ..Default::default()
    }
  }

  /// Next provisional id; never reuses an id that still has a pending change.
  fn next_id(&self) -> u64 {
    let max_record = self.records.iter().map(|r| r.id).max().unwrap_or(0);
    let max_pending = self.queue.max_id().unwrap_or(0);
    max_record.max(max_pending) + 1
  }

  /// The version of `remote` to keep given what is still queued for its id.
  fn overlay_pending(&self, mut remote: Record) -> Option<Record> {
    let local = self.records.iter().find(|r| r.id == remote.id);
    match self.queue.get(remote.id) {
      None => Some(remote),
      Some(PendingChange::Delete) => None,
      Some(PendingChange::Create { record }) => Some(record.clone()),
      Some(PendingChange::Update { patch }) => {
        patch.apply_to(&mut remote);
        if let Some(local) = local {
          remote.touch(local.updated_at);
        }
        Some(remote)
      }
    }
  }

  /// Returns the ack outcome and whether any record changed.
  fn confirm(&mut self, sent: &DrainedChange, remote: Option<&Record>) -> (AckOutcome, bool) {
    if !matches!(sent.change, PendingChange::Create { .. }) {
      return (self.queue.ack_revision(sent.id, sent.revision), false);
    }

    let old_id = self.moved.remove(&sent.id).unwrap_or(sent.id);
    let new_id = remote.map(|r| r.id).unwrap_or(old_id);
    let mut records_changed = false;

    if new_id != old_id && self.records.iter().any(|r| r.id == new_id) {
      if !matches!(self.queue.get(new_id), Some(PendingChange::Create { .. })) {
        // A fetch already brought in the stored copy
        return (self.adopt_stored_copy(old_id, sent.revision, new_id), true);
      }
      // Another provisional record holds the id; move it out of the way
      let fresh = self.next_id();
      self.move_provisional(new_id, fresh);
      records_changed = true;
    }

    let outcome = self.queue.ack_created(old_id, sent.revision, new_id);
    match outcome {
      AckOutcome::Removed | AckOutcome::Superseded => {
        if new_id != old_id {
          records_changed |= self.rename_record(old_id, new_id);
        }
      }
      AckOutcome::Missing => {
        // Deleted locally while the create was in flight
        if !self.records.iter().any(|r| r.id == old_id) {
          self.queue.record(new_id, PendingChange::Delete);
        }
      }
    }

    (outcome, records_changed)
  }

  /// Settle a create whose stored copy is already held under `new_id`.
  ///
  /// The provisional record is dropped. Edits made to it while the create
  /// was in flight are queued as an update of `new_id`, and a delete made
  /// in flight deletes `new_id`.
  fn adopt_stored_copy(&mut self, old_id: u64, revision: u64, new_id: u64) -> AckOutcome {
    let outcome = self.queue.ack_revision(old_id, revision);
    match outcome {
      AckOutcome::Removed => {}
      AckOutcome::Superseded => {
        if let Some(PendingChange::Create { mut record }) = self.queue.get(old_id).cloned() {
          self.queue.ack(old_id);
          record.id = new_id;
          self.queue.record(
            new_id,
            PendingChange::Update {
              patch: RecordPatch::from_record(&record),
            },
          );
          if let Some(stored) = self.records.iter_mut().find(|r| r.id == new_id) {
            *stored = record;
          }
        }
      }
      AckOutcome::Missing => {
        if !self.records.iter().any(|r| r.id == old_id) {
          self.records.retain(|r| r.id != new_id);
          self.queue.record(new_id, PendingChange::Delete);
        }
      }
    }
    self.records.retain(|r| r.id != old_id);
    debug!(old_id, new_id, "Dropped provisional copy of a record already fetched");
    outcome
  }

  /// Move pending creates whose provisional id a remote record also uses.
  ///
  /// A remote record with the same `created_at` is the create itself,
  /// already stored remotely, and keeps the id. Returns whether anything moved.
  fn make_room_for(&mut self, remote: &[Record]) -> bool {
    let Some(max_remote) = remote.iter().map(|r| r.id).max() else {
      return false;
    };
    let mut fresh = self.next_id().max(max_remote + 1);
    let mut moved = false;

    for record in remote {
      let collides = match self.queue.get(record.id) {
        Some(PendingChange::Create { record: local }) => local.created_at != record.created_at,
        _ => false,
      };
      if collides {
        debug!(id = record.id, fresh, "Remote record uses a provisional id; moving local create");
        self.move_provisional(record.id, fresh);
        fresh += 1;
        moved = true;
      }
    }
    moved
  }

  /// Give a provisional record and its pending create a new id.
  fn move_provisional(&mut self, old_id: u64, new_id: u64) {
    self.rename_record(old_id, new_id);
    self.queue.rekey(old_id, new_id);
    for current in self.moved.values_mut() {
      if *current == old_id {
        *current = new_id;
      }
    }
    self.moved.entry(old_id).or_insert(new_id);
  }

  fn rename_record(&mut self, old_id: u64, new_id: u64) -> bool {
    match self.records.iter_mut().find(|r| r.id == old_id) {
      Some(record) => {
        record.id = new_id;
        true
      }
      None => false,
    }
  }
}

/// Stable content digest of a record sequence.
pub fn snapshot_digest(records: &[Record]) -> String {
  let mut hasher = Sha256::new();
  for record in records {
    // Serializing a Record cannot fail: no maps with non-string keys
    if let Ok(bytes) = serde_json::to_vec(record) {
      hasher.update(&bytes);
    }
    hasher.update(b"\n");
  }
  hex::encode(hasher.finalize())
}
