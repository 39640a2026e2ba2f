//! One flush of the pending queue through the remote store.

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::cache::CachePort;
use crate::error::{SyncError, SyncResult};
use crate::event::{LifecycleSignal, StoreEvent};
use crate::record::Record;
use crate::remote::RemoteStore;
use crate::store::{DrainedChange, EntityStore, PendingChange};

/// Observable scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
  /// Nothing queued.
  Idle,
  /// Changes queued, no flush running.
  Dirty,
  /// A flush is in progress.
  Flushing,
  /// The last flush left failed changes queued.
  DirtyWithErrors,
}

/// What started a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
  Debounce,
  Retry,
  Lifecycle(LifecycleSignal),
  SyncNow,
}

/// Outcome of one flush attempt.
#[derive(Debug, Clone)]
pub struct FlushReport {
  pub trigger: FlushTrigger,
  /// Another flush was already running; nothing was sent.
  pub skipped: bool,
  pub sent: usize,
  pub acked: usize,
  /// Updates the remote did not recognise, re-queued as creates.
  pub requeued: usize,
  /// Changes left queued, with the error that stopped them.
  pub failed: Vec<(u64, SyncError)>,
}

impl FlushReport {
  fn new(trigger: FlushTrigger) -> Self {
    Self {
      trigger,
      skipped: false,
      sent: 0,
      acked: 0,
      requeued: 0,
      failed: Vec::new(),
    }
  }

  fn skipped(trigger: FlushTrigger) -> Self {
    Self {
      skipped: true,
      ..Self::new(trigger)
    }
  }

  pub fn is_clean(&self) -> bool {
    !self.skipped && self.failed.is_empty()
  }
}

/// Releases the single-flight flag when dropped, even on cancellation.
pub struct FlightGuard<'a> {
  flag: &'a AtomicBool,
  landed: &'a Notify,
}

impl Drop for FlightGuard<'_> {
  fn drop(&mut self) {
    self.flag.store(false, Ordering::Release);
    self.landed.notify_waiters();
  }
}

/// Drains the pending queue to the remote, one request per entity.
pub struct Flusher<S: CachePort, R: RemoteStore> {
  store: Arc<EntityStore<S>>,
  remote: Arc<R>,
  request_timeout: Duration,
  is_flushing: AtomicBool,
  landed: Notify,
  state: watch::Sender<FlushState>,
}

impl<S: CachePort, R: RemoteStore> Flusher<S, R> {
  pub fn new(store: Arc<EntityStore<S>>, remote: Arc<R>, request_timeout: Duration) -> Self {
    let initial = if store.has_pending_changes() {
      FlushState::Dirty
    } else {
      FlushState::Idle
    };
    let (state, _rx) = watch::channel(initial);

    Self {
      store,
      remote,
      request_timeout,
      is_flushing: AtomicBool::new(false),
      landed: Notify::new(),
      state,
    }
  }

  pub fn store(&self) -> &Arc<EntityStore<S>> {
    &self.store
  }

  pub fn request_timeout(&self) -> Duration {
    self.request_timeout
  }

  pub fn is_flushing(&self) -> bool {
    self.is_flushing.load(Ordering::Acquire)
  }

  pub fn state(&self) -> FlushState {
    *self.state.borrow()
  }

  pub fn subscribe_state(&self) -> watch::Receiver<FlushState> {
    self.state.subscribe()
  }

  pub(crate) fn set_state(&self, state: FlushState) {
    self.state.send_replace(state);
  }

  /// Take the single-flight flag, or `None` if a flush already holds it.
  pub fn try_begin(&self) -> Option<FlightGuard<'_>> {
    self
      .is_flushing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| FlightGuard {
        flag: &self.is_flushing,
        landed: &self.landed,
      })
  }

  /// Wait until no flush holds the single-flight flag.
  pub async fn wait_idle(&self) {
    loop {
      let landed = self.landed.notified();
      tokio::pin!(landed);
      // Register before checking so a release in between is not missed
      landed.as_mut().enable();
      if !self.is_flushing() {
        return;
      }
      landed.await;
    }
  }

  /// Send every queued change once.
  ///
  /// Changes go out concurrently and fail independently: each success is
  /// acknowledged on its own, each failure stays queued for the next trigger.
  /// Calling this while a flush is running is a no-op.
  pub async fn flush(&self, trigger: FlushTrigger) -> FlushReport {
    let Some(_guard) = self.try_begin() else {
      debug!(?trigger, "Flush already running; skipping");
      return FlushReport::skipped(trigger);
    };

    let batch = self.store.drain();
    let mut report = FlushReport::new(trigger);
    if batch.is_empty() {
      self.set_state(FlushState::Idle);
      return report;
    }

    self.set_state(FlushState::Flushing);
    report.sent = batch.changes.len();
    info!(?trigger, count = report.sent, "Flushing pending changes");

    let results = join_all(batch.changes.iter().map(|change| self.send(change))).await;

    for (change, result) in batch.changes.iter().zip(results) {
      match result {
        Ok(remote) => {
          self.store.confirm(&batch, change, remote.as_ref());
          report.acked += 1;
        }
        // Already gone remotely
        Err(SyncError::NotFound { .. }) if matches!(change.change, PendingChange::Delete) => {
          self.store.confirm(&batch, change, None);
          report.acked += 1;
        }
        Err(SyncError::NotFound { id })
          if matches!(change.change, PendingChange::Update { .. })
            && self.store.promote_to_create(batch.generation, id) =>
        {
          warn!(id, "Remote no longer has record; re-queued as create");
          report.requeued += 1;
        }
        Err(e) => {
          warn!(id = change.id, kind = change.change.kind(), error = %e, "Change not accepted; keeping it queued");
          report.failed.push((change.id, e));
        }
      }
    }

    let next = if !report.failed.is_empty() {
      FlushState::DirtyWithErrors
    } else if self.store.has_pending_changes() {
      FlushState::Dirty
    } else {
      FlushState::Idle
    };
    self.set_state(next);

    info!(
      acked = report.acked,
      requeued = report.requeued,
      failed = report.failed.len(),
      "Flush finished"
    );
    self.store.emit(StoreEvent::Flushed {
      acked: report.acked,
      failed: report
        .failed
        .iter()
        .map(|(id, e)| (*id, e.to_string()))
        .collect(),
    });

    report
  }

  /// Issue the request for one change, bounded by the request timeout.
  ///
  /// Returns the stored record for creates.
  async fn send(&self, change: &DrainedChange) -> SyncResult<Option<Record>> {
    let request = async {
      match &change.change {
        PendingChange::Create { record } => self.remote.create(record).await.map(Some),
        PendingChange::Update { patch } => self.remote.update(change.id, patch).await.map(|_| None),
        PendingChange::Delete => self.remote.delete(change.id).await.map(|_| None),
      }
    };

    match tokio::time::timeout(self.request_timeout, request).await {
      Ok(result) => result,
      Err(_) => Err(SyncError::transport(format!(
        "request for record {} timed out after {:?}",
        change.id, self.request_timeout
      ))),
    }
  }
}
