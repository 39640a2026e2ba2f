//! Serde types matching the remote collection API.
//!
//! These types are separate from domain types so the envelope handling stays
//! in one place.

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::record::Record;

/// `{ success, data?, message? }` envelope used by every endpoint.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
  #[serde(default)]
  pub success: bool,
  pub data: Option<T>,
  pub message: Option<String>,
}

impl<T> ApiEnvelope<T> {
  /// Unwrap `data`, treating `success:false` as a rejected request.
  pub fn into_data(self, status: u16) -> SyncResult<T> {
    if !self.success {
      return Err(SyncError::Transport {
        status: Some(status),
        message: self
          .message
          .unwrap_or_else(|| "remote rejected the request".to_string()),
      });
    }
    self
      .data
      .ok_or_else(|| SyncError::MalformedResponse("response has no data field".into()))
  }
}

impl ApiEnvelope<Vec<Record>> {
  /// Single-record endpoints wrap the record in a one-element array.
  pub fn into_single(self, status: u16) -> SyncResult<Record> {
    self
      .into_data(status)?
      .into_iter()
      .next()
      .ok_or_else(|| SyncError::MalformedResponse("response data array is empty".into()))
  }
}

/// Body for `POST /collection/sync`.
#[derive(Debug, Serialize)]
pub struct ReplaceAllBody<'a> {
  pub records: &'a [Record],
}

/// Body for `POST /import`.
#[derive(Debug, Serialize)]
pub struct ImportBody<'a> {
  pub url: &'a str,
}

/// Response of `POST /import`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiImportResponse {
  #[serde(default)]
  pub success: bool,
  #[serde(default)]
  pub data: Vec<Record>,
  pub source_title: Option<String>,
  pub total_count: Option<usize>,
  pub message: Option<String>,
}

/// Records pulled in from an external source.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportResult {
  pub records: Vec<Record>,
  pub source_title: String,
  pub total_count: usize,
}

impl From<ApiImportResponse> for ImportResult {
  fn from(response: ApiImportResponse) -> Self {
    let total_count = response.total_count.unwrap_or(response.data.len());
    Self {
      records: response.data,
      source_title: response.source_title.unwrap_or_default(),
      total_count,
    }
  }
}
