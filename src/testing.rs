//! In-memory remote store with scriptable failures, for tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{SyncError, SyncResult};
use crate::record::{NewRecord, Record, RecordPatch};
use crate::remote::{ImportResult, RemoteStore};

#[derive(Default)]
pub struct FakeRemote {
  records: Mutex<Vec<Record>>,
  calls: Mutex<Vec<&'static str>>,
  failing_ids: Mutex<HashSet<u64>>,
  offline: AtomicBool,
  hanging: AtomicBool,
  /// When non-zero, creates are stored under ids counting up from here.
  next_server_id: AtomicU64,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_records(records: Vec<Record>) -> Self {
    let remote = Self::default();
    *remote.records.lock().unwrap() = records;
    remote
  }

  pub fn records(&self) -> Vec<Record> {
    self.records.lock().unwrap().clone()
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn set_hanging(&self, hanging: bool) {
    self.hanging.store(hanging, Ordering::SeqCst);
  }

  pub fn fail_id(&self, id: u64) {
    self.failing_ids.lock().unwrap().insert(id);
  }

  pub fn reassign_ids_from(&self, first: u64) {
    self.next_server_id.store(first, Ordering::SeqCst);
  }

  pub fn call_count(&self, kind: &str) -> usize {
    self.calls.lock().unwrap().iter().filter(|c| **c == kind).count()
  }

  async fn enter(&self, kind: &'static str, id: Option<u64>) -> SyncResult<()> {
    self.calls.lock().unwrap().push(kind);
    if self.hanging.load(Ordering::SeqCst) {
      std::future::pending::<()>().await;
    }
    if self.offline.load(Ordering::SeqCst) {
      return Err(SyncError::transport("connection refused"));
    }
    if let Some(id) = id {
      if self.failing_ids.lock().unwrap().contains(&id) {
        return Err(SyncError::Transport {
          status: Some(500),
          message: format!("HTTP 500: record {} rejected", id),
        });
      }
    }
    Ok(())
  }
}

#[async_trait]
impl RemoteStore for FakeRemote {
  async fn create(&self, record: &Record) -> SyncResult<Record> {
    self.enter("create", Some(record.id)).await?;
    let mut stored = record.clone();
    let next = self.next_server_id.load(Ordering::SeqCst);
    if next != 0 {
      stored.id = next;
      self.next_server_id.store(next + 1, Ordering::SeqCst);
    }
    self.records.lock().unwrap().push(stored.clone());
    Ok(stored)
  }

  async fn fetch_one(&self, id: u64) -> SyncResult<Record> {
    self.enter("fetch_one", Some(id)).await?;
    self
      .records
      .lock()
      .unwrap()
      .iter()
      .find(|r| r.id == id)
      .cloned()
      .ok_or(SyncError::NotFound { id })
  }

  async fn update(&self, id: u64, patch: &RecordPatch) -> SyncResult<Record> {
    self.enter("update", Some(id)).await?;
    let mut records = self.records.lock().unwrap();
    let record = records
      .iter_mut()
      .find(|r| r.id == id)
      .ok_or(SyncError::NotFound { id })?;
    patch.apply_to(record);
    Ok(record.clone())
  }

  async fn delete(&self, id: u64) -> SyncResult<()> {
    self.enter("delete", Some(id)).await?;
    let mut records = self.records.lock().unwrap();
    let before = records.len();
    records.retain(|r| r.id != id);
    if records.len() == before {
      return Err(SyncError::NotFound { id });
    }
    Ok(())
  }

  async fn fetch_all(&self) -> SyncResult<Vec<Record>> {
    self.enter("fetch_all", None).await?;
    Ok(self.records())
  }

  async fn replace_all(&self, records: &[Record]) -> SyncResult<Vec<Record>> {
    self.enter("replace_all", None).await?;
    *self.records.lock().unwrap() = records.to_vec();
    Ok(records.to_vec())
  }

  async fn import_from_source(&self, _url: &str) -> SyncResult<ImportResult> {
    self.enter("import", None).await?;
    let now = chrono::Utc::now();
    let records = vec![
      Record::new(100, NewRecord::titled("Kotlin"), now),
      Record::new(101, NewRecord::titled("Swift"), now),
    ];
    self.records.lock().unwrap().extend(records.clone());
    Ok(ImportResult {
      total_count: records.len(),
      records,
      source_title: "Sample roadmap".to_string(),
    })
  }
}
