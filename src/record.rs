//! Tracked record model and partial-field diffs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Progress status of a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
  #[default]
  NotStarted,
  InProgress,
  Completed,
}

impl Status {
  pub fn as_str(&self) -> &'static str {
    match self {
      Status::NotStarted => "not-started",
      Status::InProgress => "in-progress",
      Status::Completed => "completed",
    }
  }
}

impl fmt::Display for Status {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Status {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().replace('_', "-").as_str() {
      "not-started" => Ok(Status::NotStarted),
      "in-progress" => Ok(Status::InProgress),
      "completed" | "done" => Ok(Status::Completed),
      other => Err(format!(
        "unknown status '{}': expected not-started, in-progress or completed",
        other
      )),
    }
  }
}

/// One tracked entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
  pub id: u64,
  pub title: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub status: Status,
  #[serde(default)]
  pub notes: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub study_start_date: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub study_end_date: Option<String>,
  #[serde(default = "Utc::now")]
  pub created_at: DateTime<Utc>,
  #[serde(default = "Utc::now")]
  pub updated_at: DateTime<Utc>,
}

impl Record {
  /// Build a fresh record with a provisional id.
  pub fn new(id: u64, fields: NewRecord, now: DateTime<Utc>) -> Self {
    Self {
      id,
      title: fields.title,
      description: fields.description,
      status: fields.status,
      notes: fields.notes,
      category: fields.category,
      study_start_date: fields.study_start_date,
      study_end_date: fields.study_end_date,
      created_at: now,
      updated_at: now,
    }
  }

  /// Stamp `updated_at`, never moving it backwards.
  pub fn touch(&mut self, now: DateTime<Utc>) {
    if now > self.updated_at {
      self.updated_at = now;
    }
  }
}

/// Fields supplied when creating a record locally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewRecord {
  pub title: String,
  pub description: String,
  pub status: Status,
  pub notes: String,
  pub category: Option<String>,
  pub study_start_date: Option<String>,
  pub study_end_date: Option<String>,
}

impl NewRecord {
  pub fn titled(title: impl Into<String>) -> Self {
    Self {
      title: title.into(),
      ..Default::default()
    }
  }
}

/// Partial-field diff. `None` leaves a field untouched.
///
/// Optional record fields use a nested option so a diff can clear them:
/// `Some(None)` serializes as `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<Status>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
  #[serde(
    default,
    skip_serializing_if = "Option::is_none",
    deserialize_with = "deserialize_some"
  )]
  pub category: Option<Option<String>>,
  #[serde(
    default,
    skip_serializing_if = "Option::is_none",
    deserialize_with = "deserialize_some"
  )]
  pub study_start_date: Option<Option<String>>,
  #[serde(
    default,
    skip_serializing_if = "Option::is_none",
    deserialize_with = "deserialize_some"
  )]
  pub study_end_date: Option<Option<String>>,
}

/// Distinguish an explicit `null` from an absent key.
fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
  T: Deserialize<'de>,
  D: Deserializer<'de>,
{
  T::deserialize(deserializer).map(Some)
}

impl RecordPatch {
  pub fn status(status: Status) -> Self {
    Self {
      status: Some(status),
      ..Default::default()
    }
  }

  /// A patch that overwrites every mutable field with the record's values.
  pub fn from_record(record: &Record) -> Self {
    Self {
      title: Some(record.title.clone()),
      description: Some(record.description.clone()),
      status: Some(record.status),
      notes: Some(record.notes.clone()),
      category: Some(record.category.clone()),
      study_start_date: Some(record.study_start_date.clone()),
      study_end_date: Some(record.study_end_date.clone()),
    }
  }

  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }

  /// Merge a later patch into this one; the later patch wins per field.
  pub fn merge(&mut self, later: RecordPatch) {
    if later.title.is_some() {
      self.title = later.title;
    }
    if later.description.is_some() {
      self.description = later.description;
    }
    if later.status.is_some() {
      self.status = later.status;
    }
    if later.notes.is_some() {
      self.notes = later.notes;
    }
    if later.category.is_some() {
      self.category = later.category;
    }
    if later.study_start_date.is_some() {
      self.study_start_date = later.study_start_date;
    }
    if later.study_end_date.is_some() {
      self.study_end_date = later.study_end_date;
    }
  }

  /// Overwrite the fields present in this patch. Timestamps are not touched.
  pub fn apply_to(&self, record: &mut Record) {
    if let Some(title) = &self.title {
      record.title = title.clone();
    }
    if let Some(description) = &self.description {
      record.description = description.clone();
    }
    if let Some(status) = self.status {
      record.status = status;
    }
    if let Some(notes) = &self.notes {
      record.notes = notes.clone();
    }
    if let Some(category) = &self.category {
      record.category = category.clone();
    }
    if let Some(start) = &self.study_start_date {
      record.study_start_date = start.clone();
    }
    if let Some(end) = &self.study_end_date {
      record.study_end_date = end.clone();
    }
  }
}
