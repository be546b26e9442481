//! Change watcher.
//!
//! Subscribers register a [`WatchKey`] (a collection and a document id
//! prefix) and receive batches of committed [`Change`]s through an unbounded
//! channel. Changes for one watch arrive in commit order; there is no
//! ordering guarantee across watches.

use crate::store::Change;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Watch identifier, unique per hub.
pub type WatchId = u64;

/// What a watch observes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchKey {
    pub collection: String,
    /// Empty matches every document in the collection.
    #[serde(default)]
    pub id_prefix: String,
}

impl WatchKey {
    pub fn new(collection: impl Into<String>, id_prefix: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id_prefix: id_prefix.into(),
        }
    }

    /// Check if this key covers a change.
    pub fn matches(&self, change: &Change) -> bool {
        change.collection == self.collection && change.id.starts_with(&self.id_prefix)
    }
}

/// A live subscription.
#[derive(Debug)]
pub struct Watch {
    pub id: WatchId,
    pub key: WatchKey,
    pub changes: mpsc::UnboundedReceiver<Vec<Change>>,
}

struct Subscriber {
    key: WatchKey,
    tx: mpsc::UnboundedSender<Vec<Change>>,
}

/// Fan-out point for committed changes.
pub struct WatchHub {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<WatchId, Subscriber>>,
}

impl Default for WatchHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WatchHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHub")
            .field("watches", &self.len())
            .finish()
    }
}

impl WatchHub {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Start a watch.
    pub fn watch(&self, key: WatchKey) -> Watch {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().insert(
            id,
            Subscriber {
                key: key.clone(),
                tx,
            },
        );
        tracing::debug!(watch_id = id, collection = %key.collection, prefix = %key.id_prefix, "watch started");
        Watch {
            id,
            key,
            changes: rx,
        }
    }

    /// Stop a watch. Returns false if it was not registered.
    pub fn stop(&self, id: WatchId) -> bool {
        let removed = self.subscribers.write().remove(&id).is_some();
        if removed {
            tracing::debug!(watch_id = id, "watch stopped");
        }
        removed
    }

    /// Deliver committed changes to every matching watch.
    ///
    /// Watches whose receiver has been dropped are removed.
    pub fn publish(&self, changes: &[Change]) {
        if changes.is_empty() {
            return;
        }
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (id, sub) in subscribers.iter() {
                let matching: Vec<Change> = changes
                    .iter()
                    .filter(|c| sub.key.matches(c))
                    .cloned()
                    .collect();
                if matching.is_empty() {
                    continue;
                }
                if sub.tx.send(matching).is_err() {
                    closed.push(*id);
                }
            }
        }
        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    /// Number of live watches.
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
