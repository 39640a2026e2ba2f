//! Fetch, flush and scheduling on top of the entity store.

mod engine;
mod flush;
mod policy;
mod scheduler;

pub use engine::{endpoint_override, set_endpoint, EngineOptions, SyncEngine};
pub use flush::{FlightGuard, FlushReport, FlushState, FlushTrigger, Flusher};
pub use policy::{FetchPolicy, FetchResult, FetchSource};
pub use scheduler::{FlushScheduler, SchedulerConfig, VisibleHook};
