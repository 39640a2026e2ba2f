//! Per-entity coalesced queue of unsent changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::record::{Record, RecordPatch};

/// An unsent change for one record id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PendingChange {
  /// Record exists only locally; carries the full record body.
  Create { record: Record },
  /// Field diff against a record the remote already has.
  Update { patch: RecordPatch },
  /// Deletion marker.
  Delete,
}

impl PendingChange {
  pub fn kind(&self) -> &'static str {
    match self {
      PendingChange::Create { .. } => "create",
      PendingChange::Update { .. } => "update",
      PendingChange::Delete => "delete",
    }
  }

  /// Coalesce `later` into `self`. `None` means the two cancel out.
  fn coalesce(self, later: PendingChange) -> Option<PendingChange> {
    use PendingChange::*;

    match (self, later) {
      (Create { mut record }, Update { patch }) => {
        patch.apply_to(&mut record);
        Some(Create { record })
      }
      (Create { .. }, Delete) => None,
      (Update { mut patch }, Update { patch: next }) => {
        patch.merge(next);
        Some(Update { patch })
      }
      (Update { .. }, Delete) => Some(Delete),
      (Delete, Create { record }) => Some(Update {
        patch: RecordPatch::from_record(&record),
      }),
      (_, later) => Some(later),
    }
  }
}

/// A queued change plus the revision it had when it was last touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
  pub change: PendingChange,
  pub revision: u64,
}

/// A drained snapshot of one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainedChange {
  pub id: u64,
  pub change: PendingChange,
  pub revision: u64,
}

/// Result of acknowledging a sent change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
  /// The entry was exactly what was sent and is gone now.
  Removed,
  /// The entry changed while its request was in flight and stays queued.
  Superseded,
  /// Nothing is queued for this id.
  Missing,
}

/// Coalescing queue: at most one entry per record id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingQueue {
  entries: BTreeMap<u64, PendingEntry>,
  #[serde(default)]
  next_revision: u64,
}

impl PendingQueue {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record a change, merging into an existing entry for the same id.
  pub fn record(&mut self, id: u64, change: PendingChange) {
    self.next_revision += 1;
    let revision = self.next_revision;

    let merged = match self.entries.remove(&id) {
      Some(existing) => existing.change.coalesce(change),
      None => Some(change),
    };

    if let Some(change) = merged {
      self.entries.insert(id, PendingEntry { change, revision });
    }
  }

  /// Snapshot of every entry, in id order. Nothing is removed.
  pub fn drain(&self) -> Vec<DrainedChange> {
    self
      .entries
      .iter()
      .map(|(id, entry)| DrainedChange {
        id: *id,
        change: entry.change.clone(),
        revision: entry.revision,
      })
      .collect()
  }

  /// Remove the entry for `id` unconditionally. Acking twice is a no-op.
  pub fn ack(&mut self, id: u64) -> bool {
    self.entries.remove(&id).is_some()
  }

  /// Remove the entry only if it is still at `revision`.
  pub fn ack_revision(&mut self, id: u64, revision: u64) -> AckOutcome {
    match self.entries.get(&id) {
      None => AckOutcome::Missing,
      Some(entry) if entry.revision == revision => {
        self.entries.remove(&id);
        AckOutcome::Removed
      }
      Some(_) => AckOutcome::Superseded,
    }
  }

  /// Acknowledge a sent create the remote stored under `new_id`.
  ///
  /// Anything queued after the create was sent is carried over to `new_id`
  /// as an update (or delete) against the now-remote record.
  pub fn ack_created(&mut self, old_id: u64, revision: u64, new_id: u64) -> AckOutcome {
    let entry = match self.entries.remove(&old_id) {
      None => return AckOutcome::Missing,
      Some(entry) if entry.revision == revision => return AckOutcome::Removed,
      Some(entry) => entry,
    };

    let change = match entry.change {
      PendingChange::Create { record } => PendingChange::Update {
        patch: RecordPatch::from_record(&record),
      },
      other => other,
    };
    self.entries.insert(
      new_id,
      PendingEntry {
        change,
        revision: entry.revision,
      },
    );
    AckOutcome::Superseded
  }

  /// Replace the entry for `id` with a fresh create of `record`.
  pub fn promote_to_create(&mut self, id: u64, record: Record) {
    self.next_revision += 1;
    self.entries.insert(
      id,
      PendingEntry {
        change: PendingChange::Create { record },
        revision: self.next_revision,
      },
    );
  }

  /// Move an entry to a different id, rewriting a carried record's id too.
  pub fn rekey(&mut self, old_id: u64, new_id: u64) {
    if let Some(mut entry) = self.entries.remove(&old_id) {
      if let PendingChange::Create { record } = &mut entry.change {
        record.id = new_id;
      }
      self.entries.insert(new_id, entry);
    }
  }

  pub fn get(&self, id: u64) -> Option<&PendingChange> {
    self.entries.get(&id).map(|e| &e.change)
  }

  pub fn contains(&self, id: u64) -> bool {
    self.entries.contains_key(&id)
  }

  pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
    self.entries.keys().copied()
  }

  pub fn max_id(&self) -> Option<u64> {
    self.entries.keys().next_back().copied()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
