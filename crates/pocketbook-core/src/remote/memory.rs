//! In-process remote store

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::RemoteStore;
use crate::error::{SyncError, SyncResult};
use crate::identity::UserId;
use crate::payload::{RemoteRecord, SyncedPayload};

/// Remote store kept in memory
///
/// Counts calls so tests can assert exactly how many round-trips happened,
/// and can be switched offline to simulate backend failures.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    records: Mutex<HashMap<UserId, RemoteRecord>>,
    fetches: AtomicUsize,
    upserts: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `fetch_record` calls so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of `upsert_record` calls so far
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Make every call fail with a backend error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Read a record without counting it as a fetch
    pub fn record(&self, user_id: &UserId) -> Option<RemoteRecord> {
        self.lock().get(user_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, RemoteRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_online(&self) -> SyncResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::backend("remote store offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn fetch_record(&self, user_id: &UserId) -> SyncResult<Option<RemoteRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self.lock().get(user_id).cloned())
    }

    async fn upsert_record(
        &self,
        user_id: &UserId,
        payload: &SyncedPayload,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.lock().insert(
            user_id.clone(),
            RemoteRecord {
                user_id: user_id.clone(),
                payload: payload.clone(),
                updated_at,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_replaces_record() {
        let store = MemoryRemoteStore::new();
        let user = UserId::new("user-1").unwrap();

        assert!(store.fetch_record(&user).await.unwrap().is_none());

        let v1: SyncedPayload = [("bankAccounts", "v1")].into_iter().collect();
        let v2: SyncedPayload = [("bankAccounts", "v2")].into_iter().collect();
        store.upsert_record(&user, &v1, Utc::now()).await.unwrap();
        store.upsert_record(&user, &v2, Utc::now()).await.unwrap();

        let record = store.fetch_record(&user).await.unwrap().unwrap();
        assert_eq!(record.payload, v2);
        assert_eq!(store.upsert_count(), 2);
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_records_are_per_user() {
        let store = MemoryRemoteStore::new();
        let alice = UserId::new("alice").unwrap();
        let bob = UserId::new("bob").unwrap();

        let payload: SyncedPayload = [("watchlist", "[]")].into_iter().collect();
        store.upsert_record(&alice, &payload, Utc::now()).await.unwrap();

        assert!(store.fetch_record(&bob).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offline_fails_transiently() {
        let store = MemoryRemoteStore::new();
        store.set_offline(true);

        let err = store
            .fetch_record(&UserId::new("user-1").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
