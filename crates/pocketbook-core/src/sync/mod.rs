//! Snapshot sync between the local store and the remote record
//!
//! ## Protocol
//!
//! 1. On login, pull; if that changed local data, reload once and pull again
//! 2. Push the local snapshot so the remote matches this device
//! 3. Steady state: pull and push on independent tickers
//!
//! Conflicts are resolved last-writer-wins on whole snapshots.
//!
//! ## Usage
//!
//! ```ignore
//! let engine = Arc::new(SyncEngine::new(local, remote, throttle));
//! let mut handle = spawn_sync_task(engine, identity.subscribe(), RuntimeOptions::default());
//! while let Some(event) = handle.event_rx.recv().await {
//!     // react to Reload / RefreshSuggested
//! }
//! ```

mod engine;
mod runtime;

pub use engine::{BootstrapOutcome, PullOutcome, PushOutcome, SkipReason, SyncEngine};
pub use runtime::{
    disabled_handle, spawn_sync_task, RuntimeOptions, SyncCommand, SyncEvent, SyncHandle,
    SyncPhase,
};
