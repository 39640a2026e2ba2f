//! Cache storage backends: SQLite for durability, memory for tests and embedding.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::CachePort;
use crate::error::{SyncError, SyncResult};

/// Storage that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> SyncResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
    self
      .entries
      .lock()
      .map_err(|e| SyncError::Cache(format!("Lock poisoned: {}", e)))
  }
}

impl CachePort for MemoryStorage {
  fn get(&self, key: &str) -> SyncResult<Option<String>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> SyncResult<()> {
    self.lock()?.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> SyncResult<()> {
    self.lock()?.remove(key);
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the cache database at the default location.
  pub fn open_default() -> SyncResult<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the cache database at `path`.
  pub fn open(path: &Path) -> SyncResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| SyncError::Cache(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::Cache(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Cache database that is discarded when dropped.
  pub fn open_in_memory() -> SyncResult<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> SyncResult<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> SyncResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::Cache("Could not determine data directory".into()))?;

    Ok(data_dir.join("techtrack").join("cache.db"))
  }

  fn lock(&self) -> SyncResult<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::Cache(format!("Lock poisoned: {}", e)))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> SyncResult<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| SyncError::Cache(format!("Failed to run cache migrations: {}", e)))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_cache (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl CachePort for SqliteStorage {
  fn get(&self, key: &str) -> SyncResult<Option<String>> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT value FROM kv_cache WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| SyncError::Cache(format!("Failed to read '{}': {}", key, e)))
  }

  fn set(&self, key: &str, value: &str) -> SyncResult<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_cache (key, value, written_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| SyncError::Cache(format!("Failed to write '{}': {}", key, e)))?;
    Ok(())
  }

  fn remove(&self, key: &str) -> SyncResult<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM kv_cache WHERE key = ?", params![key])
      .map_err(|e| SyncError::Cache(format!("Failed to remove '{}': {}", key, e)))?;
    Ok(())
  }
}
