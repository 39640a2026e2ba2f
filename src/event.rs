use tokio::sync::broadcast;

/// Change notifications published by the entity store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
  /// A local mutation touched these ids and queued a pending change.
  Changed { ids: Vec<u64> },
  /// The collection was replaced by a remote snapshot.
  Replaced { count: usize },
  /// Authoritative remote records were merged in without queueing.
  Merged { ids: Vec<u64> },
  /// The active identity changed and state was rebuilt from its namespace.
  IdentityChanged { identity: Option<String> },
  /// A flush finished. `failed` holds ids left queued with their error text.
  Flushed { acked: usize, failed: Vec<(u64, String)> },
  /// A remote fetch failed and the local copy stood in.
  FetchFailed { message: String },
}

/// Host page/process lifecycle inputs for the flush scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
  /// The view went to the background.
  Hidden,
  /// The view came back to the foreground.
  Visible,
  /// The process is about to exit.
  BeforeUnload,
}

/// Typed broadcast channel owned by the store.
///
/// Emitting with no subscribers is fine; slow subscribers observe
/// `RecvError::Lagged` and should resynchronise from `get_all()`.
#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<StoreEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn emit(&self, event: StoreEvent) {
    // Ignore send errors - there may be no subscribers
    let _ = self.tx.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
    self.tx.subscribe()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(256)
  }
}
