use clap::{Args, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::SqliteStorage;
use crate::config::Config;
use crate::record::{NewRecord, Record, RecordPatch, Status};
use crate::remote::HttpRemote;
use crate::sync::{endpoint_override, set_endpoint, FetchResult, FetchSource, SyncEngine};

type Engine = SyncEngine<SqliteStorage, HttpRemote>;

/// CLI subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
  /// List records (refreshes from the remote when stale)
  List {
    /// Only show records with this status
    #[arg(short, long)]
    status: Option<Status>,
  },
  /// Show one record
  Show { id: u64 },
  /// Add a record
  Add {
    title: String,
    #[command(flatten)]
    fields: FieldArgs,
  },
  /// Edit a record's fields
  Edit {
    id: u64,
    #[arg(short, long)]
    title: Option<String>,
    #[command(flatten)]
    fields: FieldArgs,
    /// Remove the category
    #[arg(long, conflicts_with = "category")]
    clear_category: bool,
  },
  /// Delete a record
  Delete { id: u64 },
  /// Flush pending changes, then fetch
  Sync {
    /// Fetch even if local data is fresh
    #[arg(short, long)]
    force: bool,
  },
  /// Replace the remote collection with the local one
  Push,
  /// Import records from an external source URL
  Import { url: String },
  /// Switch the active user
  Switch {
    #[arg(value_name = "USER")]
    name: String,
  },
  /// Show sync status
  Status,
  /// Show, set or clear the remote endpoint override
  Endpoint {
    url: Option<String>,
    #[arg(long, conflicts_with = "url")]
    clear: bool,
  },
}

/// Record fields shared by `add` and `edit`
#[derive(Args, Debug, Clone, Default)]
pub struct FieldArgs {
  #[arg(short, long)]
  pub description: Option<String>,
  #[arg(short, long)]
  pub status: Option<Status>,
  #[arg(short, long)]
  pub notes: Option<String>,
  #[arg(long)]
  pub category: Option<String>,
  /// Study start date (YYYY-MM-DD)
  #[arg(long)]
  pub start: Option<String>,
  /// Study end date (YYYY-MM-DD)
  #[arg(long)]
  pub end: Option<String>,
}

impl FieldArgs {
  fn into_new_record(self, title: String) -> NewRecord {
    NewRecord {
      title,
      description: self.description.unwrap_or_default(),
      status: self.status.unwrap_or_default(),
      notes: self.notes.unwrap_or_default(),
      category: self.category,
      study_start_date: self.start,
      study_end_date: self.end,
    }
  }

  fn into_patch(self, title: Option<String>, clear_category: bool) -> RecordPatch {
    RecordPatch {
      title,
      description: self.description,
      status: self.status,
      notes: self.notes,
      category: if clear_category {
        Some(None)
      } else {
        self.category.map(Some)
      },
      study_start_date: self.start.map(Some),
      study_end_date: self.end.map(Some),
    }
  }
}

/// One CLI invocation against the local store
pub struct App {
  engine: Engine,
}

impl App {
  /// Open the cache, build the remote client and restore the active user.
  ///
  /// `user` overrides the persisted identity and `default_user`.
  pub fn new(config: &Config, user: Option<&str>) -> Result<Self> {
    let cache = match &config.cache.path {
      Some(path) => SqliteStorage::open(path)?,
      None => SqliteStorage::open_default()?,
    };

    let endpoint = endpoint_override(&cache)
      .unwrap_or_else(|e| {
        warn!(error = %e, "Could not read endpoint override");
        None
      })
      .unwrap_or_else(|| config.remote.url.clone());
    let options = config.engine_options()?;
    let remote = HttpRemote::new(&endpoint, options.request_timeout)?;
    info!(endpoint = %remote.base_url(), "Using remote");

    let engine = SyncEngine::new(Arc::new(cache), Arc::new(remote), options);
    match user {
      Some(user) => engine.store().switch_identity(Some(user))?,
      None => {
        engine.restore_identity(config.default_user.as_deref())?;
      }
    }

    Ok(Self { engine })
  }

  /// Execute `command`, then flush whatever is still queued.
  pub async fn run(&self, command: Command) -> Result<()> {
    let scheduler = self.engine.spawn_scheduler();
    let result = self.execute(command).await;

    if let Some(report) = scheduler.shutdown().await {
      if !report.failed.is_empty() {
        eprintln!(
          "{} change(s) could not be sent and stay queued for the next run",
          report.failed.len()
        );
      }
    }

    result
  }

  async fn execute(&self, command: Command) -> Result<()> {
    match command {
      Command::List { status } => {
        let fetched = self.engine.fetch_all(false).await?;
        print_fetch_notice(&fetched);
        let records: Vec<&Record> = fetched
          .data
          .iter()
          .filter(|r| status.map_or(true, |s| r.status == s))
          .collect();
        if records.is_empty() {
          println!("No records");
        }
        for record in records {
          println!("{}", record_line(record));
        }
      }
      Command::Show { id } => {
        let record = match self.engine.get(id) {
          Some(record) => record,
          None => self.engine.refresh_record(id).await?,
        };
        print!("{}", record_detail(&record));
      }
      Command::Add { title, fields } => {
        let record = self.engine.create(fields.into_new_record(title))?;
        println!("Added {}", record_line(&record));
      }
      Command::Edit {
        id,
        title,
        fields,
        clear_category,
      } => {
        let patch = fields.into_patch(title, clear_category);
        if patch.is_empty() {
          return Err(eyre!("Nothing to change; pass at least one field"));
        }
        let record = self.engine.update(id, patch)?;
        println!("Updated {}", record_line(&record));
      }
      Command::Delete { id } => {
        let record = self.engine.delete(id)?;
        println!("Deleted {}", record_line(&record));
      }
      Command::Sync { force } => {
        let report = self.engine.flush_now().await;
        if report.sent > 0 {
          println!(
            "Sent {} change(s): {} accepted, {} failed",
            report.sent,
            report.acked,
            report.failed.len()
          );
        }
        let fetched = self.engine.fetch_all(force).await?;
        print_fetch_notice(&fetched);
        println!("{} record(s) ({})", fetched.data.len(), source_label(fetched.source));
      }
      Command::Push => {
        let count = self.engine.push_all().await?;
        println!("Remote now holds {} record(s)", count);
      }
      Command::Import { url } => {
        let result = self.engine.import_from_source(&url).await?;
        println!(
          "Imported {} record(s) from {}",
          result.total_count,
          if result.source_title.is_empty() {
            url.as_str()
          } else {
            result.source_title.as_str()
          }
        );
      }
      Command::Switch { name } => {
        let fetched = self.engine.switch_identity(&name).await?;
        print_fetch_notice(&fetched);
        println!("Switched to {} ({} record(s))", name, fetched.data.len());
      }
      Command::Status => self.print_status(),
      Command::Endpoint { url, clear } => {
        let cache = self.engine.store().cache();
        if clear {
          set_endpoint(&**cache, None)?;
          println!("Endpoint override cleared");
        } else if let Some(url) = url {
          if let Some(url) = set_endpoint(&**cache, Some(&url))? {
            println!("Endpoint set to {} (used from the next run)", url);
          }
        } else {
          match endpoint_override(&**cache)? {
            Some(url) => println!("{}", url),
            None => println!("No endpoint override"),
          }
        }
      }
    }
    Ok(())
  }

  fn print_status(&self) {
    let stats = self.engine.stats();
    println!(
      "User:      {}",
      self.engine.identity().as_deref().unwrap_or("(none)")
    );
    println!(
      "Records:   {} total, {} not started, {} in progress, {} completed ({}%)",
      stats.total(),
      stats.not_started,
      stats.in_progress,
      stats.completed,
      stats.completion_percent()
    );
    println!("Pending:   {}", self.engine.store().pending_len());
    println!(
      "Fetched:   {}",
      self
        .engine
        .store()
        .last_fetch()
        .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "not this session".to_string())
    );
  }
}

fn print_fetch_notice(fetched: &FetchResult<Vec<Record>>) {
  if let Some(e) = &fetched.error {
    eprintln!("Remote unavailable, showing local data: {}", e);
  }
}

fn source_label(source: FetchSource) -> &'static str {
  match source {
    FetchSource::Network => "fetched",
    FetchSource::Cache => "cached",
    FetchSource::Offline => "offline",
  }
}

fn record_line(record: &Record) -> String {
  let mut line = format!(
    "#{:<4} [{:<11}] {}",
    record.id,
    record.status.as_str(),
    record.title
  );
  if let Some(category) = &record.category {
    line.push_str(&format!(" ({})", category));
  }
  line
}

fn record_detail(record: &Record) -> String {
  let mut out = format!("{}\n", record_line(record));
  if !record.description.is_empty() {
    out.push_str(&format!("  {}\n", record.description));
  }
  if !record.notes.is_empty() {
    out.push_str(&format!("  Notes: {}\n", record.notes));
  }
  match (&record.study_start_date, &record.study_end_date) {
    (Some(start), Some(end)) => out.push_str(&format!("  Studied: {} to {}\n", start, end)),
    (Some(start), None) => out.push_str(&format!("  Started: {}\n", start)),
    (None, Some(end)) => out.push_str(&format!("  Finished: {}\n", end)),
    (None, None) => {}
  }
  out.push_str(&format!(
    "  Updated: {}\n",
    record.updated_at.format("%Y-%m-%d %H:%M")
  ));
  out
}
