//! Decides when the pending queue is flushed.
//!
//! The scheduler is a spawned task driven by four inputs:
//! - store events: any local change arms the debounce timer
//! - host lifecycle signals: `Hidden` and `BeforeUnload` flush immediately
//! - explicit "sync now" requests
//! - timers: the debounce deadline, and a retry deadline after failed flushes
//!
//! Flushes run on their own tasks so a trigger that arrives mid-flush hits
//! the flusher's single-flight guard instead of queueing behind it.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::flush::{FlushReport, FlushState, FlushTrigger, Flusher};
use crate::cache::CachePort;
use crate::event::{LifecycleSignal, StoreEvent};
use crate::remote::RemoteStore;

/// Callback run when the host becomes visible again.
pub type VisibleHook = Arc<dyn Fn() + Send + Sync>;

/// Scheduler timing.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
  /// Quiet period after the last change before a flush.
  pub debounce: Duration,
  /// Delay before retrying after a flush left failures behind.
  pub retry_interval: Duration,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      debounce: Duration::from_secs(2),
      retry_interval: Duration::from_secs(30),
    }
  }
}

enum Command {
  Lifecycle(LifecycleSignal),
  SyncNow(oneshot::Sender<FlushReport>),
  Shutdown(oneshot::Sender<FlushReport>),
}

/// Outcome of a spawned flush, fed back into the loop.
struct Settled {
  failed: bool,
}

/// Handle to a running flush scheduler.
pub struct FlushScheduler {
  tx: mpsc::UnboundedSender<Command>,
  state: watch::Receiver<FlushState>,
  task: JoinHandle<()>,
}

impl FlushScheduler {
  /// Start the scheduler loop on the current tokio runtime.
  pub fn spawn<S, R>(
    flusher: Arc<Flusher<S, R>>,
    config: SchedulerConfig,
    on_visible: Option<VisibleHook>,
  ) -> Self
  where
    S: CachePort + 'static,
    R: RemoteStore + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = flusher.subscribe_state();
    let events = flusher.store().subscribe();

    let task = tokio::spawn(run(flusher, config, rx, events, on_visible));

    Self { tx, state, task }
  }

  /// Feed one host lifecycle transition.
  pub fn lifecycle(&self, signal: LifecycleSignal) {
    let _ = self.tx.send(Command::Lifecycle(signal));
  }

  /// Forward every signal from `signals` until the stream ends.
  pub fn attach_lifecycle<St>(&self, signals: St) -> JoinHandle<()>
  where
    St: Stream<Item = LifecycleSignal> + Send + 'static,
  {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let mut signals = Box::pin(signals);
      while let Some(signal) = signals.next().await {
        if tx.send(Command::Lifecycle(signal)).is_err() {
          break;
        }
      }
    })
  }

  /// Flush now and wait for the report. `None` if the scheduler has stopped.
  pub async fn sync_now(&self) -> Option<FlushReport> {
    let (reply, rx) = oneshot::channel();
    self.tx.send(Command::SyncNow(reply)).ok()?;
    rx.await.ok()
  }

  pub fn state(&self) -> FlushState {
    *self.state.borrow()
  }

  pub fn watch_state(&self) -> watch::Receiver<FlushState> {
    self.state.clone()
  }

  /// Best-effort final flush, then stop the loop.
  ///
  /// Waits for any in-flight flush to land first, bounded by twice the
  /// request timeout.
  pub async fn shutdown(self) -> Option<FlushReport> {
    let (reply, rx) = oneshot::channel();
    self.tx.send(Command::Shutdown(reply)).ok()?;
    let report = rx.await.ok();
    let _ = self.task.await;
    report
  }
}

async fn run<S, R>(
  flusher: Arc<Flusher<S, R>>,
  config: SchedulerConfig,
  mut commands: mpsc::UnboundedReceiver<Command>,
  mut events: broadcast::Receiver<StoreEvent>,
  on_visible: Option<VisibleHook>,
) where
  S: CachePort + 'static,
  R: RemoteStore + 'static,
{
  let (settled_tx, mut settled_rx) = mpsc::unbounded_channel::<Settled>();
  let mut deadline: Option<Instant> = None;
  let mut retrying = false;

  // Changes persisted by an earlier run
  if flusher.store().has_pending_changes() {
    flusher.set_state(FlushState::Dirty);
    deadline = Some(Instant::now() + config.debounce);
  }

  loop {
    let timer = async move {
      match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
      }
    };

    tokio::select! {
      command = commands.recv() => match command {
        None => break,
        Some(Command::Lifecycle(LifecycleSignal::Visible)) => {
          if let Some(hook) = &on_visible {
            hook();
          }
        }
        Some(Command::Lifecycle(signal)) => {
          deadline = None;
          spawn_flush(&flusher, &settled_tx, FlushTrigger::Lifecycle(signal), None);
        }
        Some(Command::SyncNow(reply)) => {
          deadline = None;
          spawn_flush(&flusher, &settled_tx, FlushTrigger::SyncNow, Some(reply));
        }
        Some(Command::Shutdown(reply)) => {
          // Let a running flush land so the final one is not skipped
          if tokio::time::timeout(flusher.request_timeout() * 2, flusher.wait_idle())
            .await
            .is_err()
          {
            warn!("In-flight flush did not finish before shutdown");
          }
          let report = flusher
            .flush(FlushTrigger::Lifecycle(LifecycleSignal::BeforeUnload))
            .await;
          info!(acked = report.acked, failed = report.failed.len(), "Scheduler stopped");
          let _ = reply.send(report);
          break;
        }
      },

      event = events.recv() => match event {
        Ok(StoreEvent::Changed { .. }) | Err(RecvError::Lagged(_)) => {
          if !flusher.is_flushing() {
            flusher.set_state(FlushState::Dirty);
          }
          retrying = false;
          deadline = Some(Instant::now() + config.debounce);
        }
        Ok(StoreEvent::IdentityChanged { .. }) => {
          retrying = false;
          if flusher.store().has_pending_changes() {
            flusher.set_state(FlushState::Dirty);
            deadline = Some(Instant::now() + config.debounce);
          } else {
            flusher.set_state(FlushState::Idle);
            deadline = None;
          }
        }
        Ok(_) => {}
        Err(RecvError::Closed) => break,
      },

      Some(settled) = settled_rx.recv() => {
        if deadline.is_none() && flusher.store().has_pending_changes() {
          retrying = settled.failed;
          let delay = if settled.failed { config.retry_interval } else { config.debounce };
          deadline = Some(Instant::now() + delay);
          debug!(retrying, ?delay, "Changes still queued after flush; rescheduled");
        }
      }

      _ = timer => {
        deadline = None;
        let trigger = if retrying { FlushTrigger::Retry } else { FlushTrigger::Debounce };
        spawn_flush(&flusher, &settled_tx, trigger, None);
      }
    }
  }
}

fn spawn_flush<S, R>(
  flusher: &Arc<Flusher<S, R>>,
  settled: &mpsc::UnboundedSender<Settled>,
  trigger: FlushTrigger,
  reply: Option<oneshot::Sender<FlushReport>>,
)
where
  S: CachePort + 'static,
  R: RemoteStore + 'static,
{
  let flusher = Arc::clone(flusher);
  let settled = settled.clone();

  tokio::spawn(async move {
    let report = flusher.flush(trigger).await;
    // A skipped flush reports nothing; the running one settles for both
    if !report.skipped {
      let _ = settled.send(Settled {
        failed: !report.failed.is_empty(),
      });
    }
    if let Some(reply) = reply {
      let _ = reply.send(report);
    }
  });
}
