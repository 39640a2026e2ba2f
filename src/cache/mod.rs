//! Persistent cache port for offline support.
//!
//! This module provides the durable key-value substrate the entity store
//! writes through to:
//! - One entry per identity holding the full record array (`data_<identity>`)
//! - One entry per identity holding the unsent pending queue (`pending_<identity>`)
//! - Global entries for the endpoint override and the active identity marker

mod storage;
mod traits;

pub use storage::{MemoryStorage, SqliteStorage};
pub use traits::{
  data_key, pending_key, CacheJson, CachePort, ACTIVE_USER_KEY, ENDPOINT_KEY,
};
