use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::EngineOptions;

pub const DEFAULT_REMOTE_URL: &str = "http://localhost:3000/api";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub remote: RemoteConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Identity used when no previous session is persisted
  pub default_user: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  #[serde(default = "default_remote_url")]
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      url: default_remote_url(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Staleness window for non-forced fetches
  #[serde(default = "default_stale_secs")]
  pub stale_secs: u64,
  #[serde(default = "default_debounce_ms")]
  pub debounce_ms: u64,
  /// Retry period while failed changes stay queued
  #[serde(default = "default_retry_secs")]
  pub retry_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      stale_secs: default_stale_secs(),
      debounce_ms: default_debounce_ms(),
      retry_secs: default_retry_secs(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Cache database location (defaults to <data_dir>/techtrack/cache.db)
  pub path: Option<PathBuf>,
}

fn default_remote_url() -> String {
  DEFAULT_REMOTE_URL.to_string()
}

fn default_timeout_secs() -> u64 {
  10
}

fn default_stale_secs() -> u64 {
  300
}

fn default_debounce_ms() -> u64 {
  2000
}

fn default_retry_secs() -> u64 {
  30
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./techtrack.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/techtrack/config.yaml
  ///
  /// Without a config file the defaults apply. An explicit path must exist.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("techtrack.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("techtrack").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  pub fn engine_options(&self) -> Result<EngineOptions> {
    let stale_time = i64::try_from(self.sync.stale_secs)
      .ok()
      .and_then(chrono::Duration::try_seconds)
      .ok_or_else(|| eyre!("sync.stale_secs is too large: {}", self.sync.stale_secs))?;

    Ok(EngineOptions {
      stale_time,
      request_timeout: Duration::from_secs(self.remote.timeout_secs),
      debounce: Duration::from_millis(self.sync.debounce_ms),
      retry_interval: Duration::from_secs(self.sync.retry_secs),
    })
  }
}
