//! Remote state store
//!
//! One record per user holding the latest full snapshot of the synced keys.
//! The backend is an external collaborator; this module only needs
//! fetch-by-id and upsert-by-id from it.
//!
//! ## Backends
//!
//! - **REST**: hosted table behind a PostgREST-style API (`rest`)
//! - **SQLite**: shared database file for self-hosting (`sqlite`)
//! - **Memory**: in-process, for tests (`memory`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SyncResult;
use crate::identity::UserId;
use crate::payload::{RemoteRecord, SyncedPayload};

pub mod memory;
pub mod rest;
pub mod sqlite;

pub use memory::MemoryRemoteStore;
pub use rest::RestRemoteStore;
pub use sqlite::{SqliteRemoteStore, SCHEMA_VERSION};

/// Remote table holding one row per user
pub const REMOTE_TABLE: &str = "user_state";

/// Single-record-per-user remote storage
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the record for `user_id`, if one was ever written
    async fn fetch_record(&self, user_id: &UserId) -> SyncResult<Option<RemoteRecord>>;

    /// Insert or replace the record for `user_id`
    async fn upsert_record(
        &self,
        user_id: &UserId,
        payload: &SyncedPayload,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<()>;
}
