//! Pocketbook Core Library
//!
//! Cloud sync for the pocketbook personal finance app. Each signed-in user
//! has one remote record holding a snapshot of the synced local keys;
//! every device pulls and pushes that snapshot so they converge.
//!
//! # Architecture
//!
//! - **Local store**: device-local string key/value pairs, the app's
//!   working copy
//! - **Remote store**: one record per user (hosted REST table or shared
//!   SQLite file)
//! - **Sync engine**: pull/push with digest de-duplication and a throttled
//!   reload when remote data lands
//!
//! # Quick Start
//!
//! ```text
//! let context = SyncContext::open()?;
//! context.identity().request_login_link("me@example.com").await?;
//!
//! let engine = context.engine()?;
//! engine.bootstrap(&user_id, true).await?;
//! ```
//!
//! # Modules
//!
//! - `context`: wiring from configuration (main entry point)
//! - `sync`: engine and background task
//! - `local`, `remote`: the two stores
//! - `identity`: login providers
//! - `session`: per-login state and the reload throttle
//! - `keys`, `payload`: the synced key set and snapshots
//! - `config`: application configuration

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod focus;
pub mod identity;
pub mod keys;
pub mod local;
pub mod payload;
pub mod remote;
pub mod session;
pub mod sync;

pub use config::{Backend, Config};
pub use context::SyncContext;
pub use error::{SyncError, SyncResult};
pub use events::{ChangeBus, ChangeEvent};
pub use identity::{EmailLinkProvider, IdentityProvider, LocalIdentityProvider, UserId};
pub use local::{FileLocalStore, LocalStore, MemoryLocalStore};
pub use payload::{RemoteRecord, SyncedPayload};
pub use remote::{MemoryRemoteStore, RemoteStore, RestRemoteStore, SqliteRemoteStore};
pub use session::{ReloadDecision, ReloadThrottle, SyncSession};
pub use sync::{
    BootstrapOutcome, PullOutcome, PushOutcome, SyncCommand, SyncEngine, SyncEvent, SyncHandle,
    SyncPhase,
};
