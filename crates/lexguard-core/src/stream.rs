use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::types::DocumentChange;

const CHANNEL_CAPACITY: usize = 256;

/// Per-owner document change notifications.
///
/// The record store publishes here after every successful mutation. Subscribers only
/// ever see changes to their own owner's documents. Receivers that lag just miss
/// events, which is fine: every consumer reacts with a full refetch.
pub struct ChangeFeed {
    channels: Mutex<HashMap<String, broadcast::Sender<DocumentChange>>>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to changes for one owner.
    pub fn subscribe(&self, owner: &str) -> broadcast::Receiver<DocumentChange> {
        let mut map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(owner.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Deliver a change to the owner's subscribers, if any.
    pub fn publish(&self, change: DocumentChange) {
        let mut map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = map.get(&change.owner) else {
            return;
        };
        if tx.receiver_count() == 0 {
            map.remove(&change.owner);
            return;
        }
        let _ = tx.send(change);
    }

    pub fn subscriber_count(&self, owner: &str) -> usize {
        let map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        map.get(owner).map(|tx| tx.receiver_count()).unwrap_or(0)
    }
}
