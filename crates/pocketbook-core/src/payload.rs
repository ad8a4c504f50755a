//! Synced payloads and remote records
//!
//! A payload is a snapshot of the synced keys. Values are serialized JSON
//! documents owned by the budget/stock/bank screens; they are compared and
//! copied as plain strings and never parsed here.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::UserId;

/// Snapshot of synced keys to their opaque string values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncedPayload(BTreeMap<String, String>);

impl SyncedPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Drop every key outside `keys`
    pub fn restricted_to(mut self, keys: &[String]) -> Self {
        self.0.retain(|k, _| keys.iter().any(|allowed| allowed == k));
        self
    }

    /// SHA-256 of the canonical serialization, lowercase hex
    ///
    /// The map is key-ordered, so equal payloads always hash equally.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in &self.0 {
            // Length prefixes keep ("ab","c") and ("a","bc") apart
            hasher.update((key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SyncedPayload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// The single remote record held for one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub user_id: UserId,
    pub payload: SyncedPayload,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::synced_keys;

    #[test]
    fn test_digest_is_order_independent() {
        let a: SyncedPayload = [("watchlist", "[]"), ("bankAccounts", "[1]")]
            .into_iter()
            .collect();
        let b: SyncedPayload = [("bankAccounts", "[1]"), ("watchlist", "[]")]
            .into_iter()
            .collect();
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_digest_changes_with_content() {
        let a: SyncedPayload = [("bankAccounts", "v1")].into_iter().collect();
        let b: SyncedPayload = [("bankAccounts", "v2")].into_iter().collect();
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn test_digest_key_value_boundaries() {
        let a: SyncedPayload = [("ab", "c")].into_iter().collect();
        let b: SyncedPayload = [("a", "bc")].into_iter().collect();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_restricted_to_synced_keys() {
        let payload: SyncedPayload = [
            ("stockPortfolio", "{}"),
            ("exchangeRate", "1350"),
            ("lastAutoReloadAt", "2026-01-01T00:00:00Z"),
        ]
        .into_iter()
        .collect();

        let restricted = payload.restricted_to(&synced_keys());
        assert_eq!(restricted.len(), 1);
        assert_eq!(restricted.get("stockPortfolio"), Some("{}"));
        assert!(restricted.get("exchangeRate").is_none());
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let payload: SyncedPayload = [("watchlist", "[\"AAPL\"]")].into_iter().collect();
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"watchlist":"[\"AAPL\"]"}"#);

        let parsed: SyncedPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, payload);
    }
}
