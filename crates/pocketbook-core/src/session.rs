//! Sync session state and the reload throttle
//!
//! `SyncSession` lives as long as a login. The reload throttle keeps its
//! timestamp in session-scoped storage: never in the local store, so it is
//! not replicated to other devices.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::identity::UserId;
use crate::local::atomic_write;

/// Session store key holding the last automatic reload time
pub const LAST_AUTO_RELOAD_KEY: &str = "lastAutoReloadAt";

/// Per-login state of the sync engine
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncSession {
    pub identity: Option<UserId>,
    pub last_pushed_digest: Option<String>,
    pub push_in_flight: bool,
    /// Set once a pull succeeded in this session
    pub baseline_established: bool,
}

impl SyncSession {
    pub fn for_identity(identity: UserId) -> Self {
        Self {
            identity: Some(identity),
            ..Self::default()
        }
    }

    /// Reset to the logged-out state
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Session-scoped string storage, separate from the synced local store
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> SyncResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> SyncResult<()>;
    fn clear(&self) -> SyncResult<()>;
}

/// Session store as one file per key in a directory
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

fn unavailable(error: impl std::fmt::Display) -> SyncError {
    SyncError::StorageUnavailable {
        details: error.to_string(),
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        let path = self.key_path(key);
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(format!("{:?}: {}", path, e))),
        }
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        let path = self.key_path(key);
        atomic_write(&path, value.as_bytes()).map_err(|e| unavailable(format!("{:?}: {}", path, e)))
    }

    fn clear(&self) -> SyncResult<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&self.dir).map_err(|e| unavailable(format!("{:?}: {}", self.dir, e)))
    }
}

/// In-process session store
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear(&self) -> SyncResult<()> {
        self.lock().clear();
        Ok(())
    }
}

/// Session store that always fails (private browsing, full disk, ...)
#[derive(Debug, Default)]
pub struct UnavailableSessionStore;

impl SessionStore for UnavailableSessionStore {
    fn get(&self, _key: &str) -> SyncResult<Option<String>> {
        Err(unavailable("session storage disabled"))
    }

    fn set(&self, _key: &str, _value: &str) -> SyncResult<()> {
        Err(unavailable("session storage disabled"))
    }

    fn clear(&self) -> SyncResult<()> {
        Err(unavailable("session storage disabled"))
    }
}

/// What to do about a pull that changed local data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadDecision {
    /// Reload dependent state from the local store
    Reload,
    /// Only tell the user a refresh would show new data
    Notify,
}

/// Limits automatic reloads to one per cooldown window
///
/// Once the session store fails, automatic reloads stay disabled for the
/// life of the throttle.
pub struct ReloadThrottle {
    store: Arc<dyn SessionStore>,
    cooldown: Duration,
    disabled: AtomicBool,
}

impl ReloadThrottle {
    pub fn new(store: Arc<dyn SessionStore>, cooldown: Duration) -> Self {
        Self {
            store,
            cooldown,
            disabled: AtomicBool::new(false),
        }
    }

    /// Whether storage failed and auto-reload was turned off
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Decide whether a reload may happen at `now`, recording it if so
    pub fn decide(&self, now: DateTime<Utc>) -> ReloadDecision {
        if self.is_disabled() {
            return ReloadDecision::Notify;
        }

        let last = match self.store.get(LAST_AUTO_RELOAD_KEY) {
            Ok(value) => value.and_then(|v| parse_timestamp(&v)),
            Err(e) => return self.disable(e),
        };

        if let Some(last) = last {
            // A timestamp in the future (clock change) still counts as recent;
            // a window ending past the representable range never ends
            let in_window = last
                .checked_add_signed(self.cooldown)
                .map_or(true, |until| now < until);
            if in_window {
                debug!("Reload throttled, last auto-reload at {}", last);
                return ReloadDecision::Notify;
            }
        }

        match self.store.set(LAST_AUTO_RELOAD_KEY, &now.to_rfc3339()) {
            Ok(()) => ReloadDecision::Reload,
            Err(e) => self.disable(e),
        }
    }

    fn disable(&self, error: SyncError) -> ReloadDecision {
        if !self.disabled.swap(true, Ordering::SeqCst) {
            warn!("Automatic reload disabled: {}", error);
        }
        ReloadDecision::Notify
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn throttle(store: Arc<dyn SessionStore>) -> ReloadThrottle {
        ReloadThrottle::new(store, Duration::minutes(30))
    }

    #[test]
    fn test_session_clear() {
        let mut session = SyncSession::for_identity(UserId::new("user-1").unwrap());
        session.last_pushed_digest = Some("abc".to_string());
        session.baseline_established = true;

        session.clear();
        assert_eq!(session, SyncSession::default());
    }

    #[test]
    fn test_one_reload_per_cooldown() {
        let throttle = throttle(Arc::new(MemorySessionStore::new()));
        let t0 = Utc::now();

        assert_eq!(throttle.decide(t0), ReloadDecision::Reload);
        assert_eq!(
            throttle.decide(t0 + Duration::minutes(5)),
            ReloadDecision::Notify
        );
        assert_eq!(
            throttle.decide(t0 + Duration::minutes(31)),
            ReloadDecision::Reload
        );
    }

    #[test]
    fn test_cooldown_past_calendar_range_stays_in_window() {
        let cooldown = Duration::try_seconds(9_000_000_000_000).unwrap();
        let throttle = ReloadThrottle::new(Arc::new(MemorySessionStore::new()), cooldown);
        let t0 = Utc::now();

        assert_eq!(throttle.decide(t0), ReloadDecision::Reload);
        assert_eq!(
            throttle.decide(t0 + Duration::days(3650)),
            ReloadDecision::Notify
        );
    }

    #[test]
    fn test_unavailable_storage_disables_reload() {
        let throttle = throttle(Arc::new(UnavailableSessionStore));

        assert_eq!(throttle.decide(Utc::now()), ReloadDecision::Notify);
        assert!(throttle.is_disabled());
        assert_eq!(
            throttle.decide(Utc::now() + Duration::days(1)),
            ReloadDecision::Notify
        );
    }

    #[test]
    fn test_unparsable_timestamp_treated_as_absent() {
        let store = Arc::new(MemorySessionStore::new());
        store.set(LAST_AUTO_RELOAD_KEY, "yesterday-ish").unwrap();

        let throttle = throttle(store.clone());
        assert_eq!(throttle.decide(Utc::now()), ReloadDecision::Reload);
        assert!(parse_timestamp(&store.get(LAST_AUTO_RELOAD_KEY).unwrap().unwrap()).is_some());
    }

    #[test]
    fn test_file_session_store_roundtrip_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(temp_dir.path().join("session"));

        assert!(store.get(LAST_AUTO_RELOAD_KEY).unwrap().is_none());
        store.set(LAST_AUTO_RELOAD_KEY, "2026-01-01T00:00:00Z").unwrap();
        assert_eq!(
            store.get(LAST_AUTO_RELOAD_KEY).unwrap().as_deref(),
            Some("2026-01-01T00:00:00Z")
        );

        store.clear().unwrap();
        assert!(store.get(LAST_AUTO_RELOAD_KEY).unwrap().is_none());
    }

    #[test]
    fn test_throttle_shares_window_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("session");
        let now = Utc::now();

        let first = throttle(Arc::new(FileSessionStore::new(dir.clone())));
        assert_eq!(first.decide(now), ReloadDecision::Reload);

        // A reloaded host builds a fresh throttle over the same session
        let after_reload = throttle(Arc::new(FileSessionStore::new(dir)));
        assert_eq!(
            after_reload.decide(now + Duration::seconds(10)),
            ReloadDecision::Notify
        );
    }
}
