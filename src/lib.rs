//! Local-first sync engine for a personal progress tracker.
//!
//! Records live in an in-memory [`store::EntityStore`] that writes through to
//! a durable [`cache::CachePort`]. Local edits are queued as coalesced diffs
//! and flushed to a [`remote::RemoteStore`] in the background by the
//! [`sync`] machinery.

pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod record;
pub mod remote;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{SyncError, SyncResult};
