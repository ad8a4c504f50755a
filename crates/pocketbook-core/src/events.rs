//! In-process change notifications
//!
//! When a shared value changes (a merged pull, a new exchange rate), the
//! writer publishes the key and every interested component re-reads it
//! from the local store.

use tokio::sync::broadcast;

/// Buffered events per subscriber before the slowest one starts lagging
const CHANNEL_CAPACITY: usize = 64;

/// A named local store key changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: String,
}

/// Publish/subscribe channel for change events
#[derive(Debug, Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Announce a change; returns the number of subscribers reached
    pub fn publish(&self, key: impl Into<String>) -> usize {
        // No subscribers is fine
        self.tx
            .send(ChangeEvent { key: key.into() })
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}
