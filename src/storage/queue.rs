// Offline queue for outbound primary-channel messages
// Capped FIFO persisted through `Storage`, flushed in order after a (re)connect

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{load_json, save_json, Storage};
use crate::network::protocol::{timestamp_ms, ClientMessage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessage {
    pub message: ClientMessage,
    pub queued_at: u64,
}

/// Persisted queue of unsent messages.
/// Each call is one read-modify-write with no suspension point in between.
pub trait PersistentQueue: Send {
    /// Everything currently queued, oldest first
    fn load(&self) -> Vec<PendingMessage>;

    /// Queue a message, discarding the oldest entries beyond capacity
    fn append(&mut self, message: ClientMessage) -> Result<()>;

    /// Take every queued message, oldest first, leaving the queue empty
    fn flush(&mut self) -> Result<Vec<PendingMessage>>;

    fn len(&self) -> usize {
        self.load().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct StoredQueue<S> {
    store: S,
    key: String,
    capacity: usize,
}

impl<S: Storage> StoredQueue<S> {
    pub fn new(store: S, key: impl Into<String>, capacity: usize) -> Self {
        Self {
            store,
            key: key.into(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<S: Storage> PersistentQueue for StoredQueue<S> {
    fn load(&self) -> Vec<PendingMessage> {
        load_json(&self.store, &self.key).unwrap_or_default()
    }

    fn append(&mut self, message: ClientMessage) -> Result<()> {
        let mut pending = self.load();
        pending.push(PendingMessage {
            message,
            queued_at: timestamp_ms(),
        });

        if pending.len() > self.capacity {
            let overflow = pending.len() - self.capacity;
            warn!("Pending queue full, discarding {} oldest message(s)", overflow);
            pending.drain(..overflow);
        }

        save_json(&mut self.store, &self.key, &pending)
    }

    fn flush(&mut self) -> Result<Vec<PendingMessage>> {
        let pending = self.load();
        self.store.remove(&self.key)?;
        if !pending.is_empty() {
            debug!("Flushing {} pending message(s)", pending.len());
        }
        Ok(pending)
    }
}
