//! Transport boundary to the remote collection store.
//!
//! The client never retries; retry is the flush scheduler's job.

pub mod api_types;
mod client;

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::record::{Record, RecordPatch};

pub use api_types::ImportResult;
pub use client::{parse_base_url, HttpRemote};

/// Operations the remote boundary supports.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Store a new record. The remote may assign a different id.
  async fn create(&self, record: &Record) -> SyncResult<Record>;

  async fn fetch_one(&self, id: u64) -> SyncResult<Record>;

  async fn update(&self, id: u64, patch: &RecordPatch) -> SyncResult<Record>;

  async fn delete(&self, id: u64) -> SyncResult<()>;

  async fn fetch_all(&self) -> SyncResult<Vec<Record>>;

  /// Replace the entire remote collection and return what was stored.
  async fn replace_all(&self, records: &[Record]) -> SyncResult<Vec<Record>>;

  async fn import_from_source(&self, url: &str) -> SyncResult<ImportResult>;
}
