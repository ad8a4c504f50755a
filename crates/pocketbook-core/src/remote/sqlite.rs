//! Self-hosted remote store on a shared SQLite file
//!
//! Every device points `remote_db` at the same database file (a network
//! share, a synced folder). The table mirrors the hosted backend: one row
//! per user, replaced wholesale on every push.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::RemoteStore;
use crate::error::{SyncError, SyncResult};
use crate::identity::UserId;
use crate::payload::{RemoteRecord, SyncedPayload};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// How long a writer waits for another device's lock on the shared file
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- One snapshot of the synced keys per user
        CREATE TABLE IF NOT EXISTS user_state (
            user_id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> rusqlite::Result<Option<i32>> {
    conn.query_row(
        "SELECT value FROM schema_info WHERE key = 'version'",
        [],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map(|v| v.and_then(|s| s.parse().ok()))
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}

/// Remote store backed by a SQLite database file
pub struct SqliteRemoteStore {
    conn: Mutex<Connection>,
}

impl SqliteRemoteStore {
    /// Open (creating if needed) the shared database at `path`
    pub fn open(path: &Path) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::backend(format!("{:?}: {}", parent, e)))?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory database (for tests)
    pub fn open_in_memory() -> SyncResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> SyncResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        if needs_init(&conn) {
            debug!("Initializing remote schema v{}", SCHEMA_VERSION);
            init_schema(&conn)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RemoteStore for SqliteRemoteStore {
    async fn fetch_record(&self, user_id: &UserId) -> SyncResult<Option<RemoteRecord>> {
        let row = self
            .lock()
            .query_row(
                "SELECT payload, updated_at FROM user_state WHERE user_id = ?1",
                [user_id.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let Some((payload, updated_at)) = row else {
            return Ok(None);
        };

        let payload: SyncedPayload = serde_json::from_str(&payload)
            .map_err(|e| SyncError::backend(format!("corrupt payload for {}: {}", user_id, e)))?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| SyncError::backend(format!("corrupt timestamp for {}: {}", user_id, e)))?
            .with_timezone(&Utc);

        Ok(Some(RemoteRecord {
            user_id: user_id.clone(),
            payload,
            updated_at,
        }))
    }

    async fn upsert_record(
        &self,
        user_id: &UserId,
        payload: &SyncedPayload,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let payload = serde_json::to_string(payload)?;
        self.lock().execute(
            "INSERT INTO user_state (user_id, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at",
            params![user_id.as_str(), payload, updated_at.to_rfc3339()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_schema_version() {
        let conn = Connection::open_in_memory().unwrap();

        assert!(needs_init(&conn));
        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
        assert!(!needs_init(&conn));
    }

    #[tokio::test]
    async fn test_upsert_and_fetch() {
        let store = SqliteRemoteStore::open_in_memory().unwrap();
        let user = UserId::new("user-1").unwrap();

        assert!(store.fetch_record(&user).await.unwrap().is_none());

        let payload: SyncedPayload = [("stockPortfolio", r#"{"TSLA":2}"#)].into_iter().collect();
        let now = Utc::now();
        store.upsert_record(&user, &payload, now).await.unwrap();

        let record = store.fetch_record(&user).await.unwrap().unwrap();
        assert_eq!(record.user_id, user);
        assert_eq!(record.payload, payload);
        assert_eq!(record.updated_at.timestamp(), now.timestamp());
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_row_per_user() {
        let store = SqliteRemoteStore::open_in_memory().unwrap();
        let user = UserId::new("user-1").unwrap();

        for version in ["v1", "v2", "v3"] {
            let payload: SyncedPayload = [("bankAccounts", version)].into_iter().collect();
            store.upsert_record(&user, &payload, Utc::now()).await.unwrap();
        }

        let count: i64 = store
            .lock()
            .query_row("SELECT COUNT(*) FROM user_state", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let record = store.fetch_record(&user).await.unwrap().unwrap();
        assert_eq!(record.payload.get("bankAccounts"), Some("v3"));
    }

    #[tokio::test]
    async fn test_shared_file_between_devices() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shared").join("remote.db");
        let user = UserId::new("me@example.com").unwrap();

        let device_a = SqliteRemoteStore::open(&path).unwrap();
        let device_b = SqliteRemoteStore::open(&path).unwrap();

        let payload: SyncedPayload = [("watchlist", "[\"NVDA\"]")].into_iter().collect();
        device_a.upsert_record(&user, &payload, Utc::now()).await.unwrap();

        let seen = device_b.fetch_record(&user).await.unwrap().unwrap();
        assert_eq!(seen.payload, payload);
    }
}
