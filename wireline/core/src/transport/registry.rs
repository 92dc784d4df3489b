//! Connection Registry
//!
//! Live set of server-side connections keyed by [`ConnectionId`].
//!
//! Membership only changes under the registry lock. Broadcasts take a
//! snapshot under the lock and release it before writing to any socket, so
//! a slow peer never blocks accepts or removals.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::serializer::{JsonSerializer, Serializer};

use super::connection::{Connection, ConnectionId, Sentinel};
use super::TransportError;

/// Result of a broadcast operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    /// Number of connections that accepted the payload
    pub successful: usize,
    /// Number of connections whose send failed
    pub failed: usize,
    /// IDs of connections that failed
    pub failed_ids: Vec<ConnectionId>,
}

impl BroadcastResult {
    /// Check if all recipients received the payload
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Check if no recipient received the payload
    #[must_use]
    pub fn all_failed(&self) -> bool {
        self.successful == 0
    }

    fn record(&mut self, id: ConnectionId, result: Result<(), TransportError>) {
        match result {
            Ok(()) => self.successful += 1,
            Err(e) => {
                tracing::debug!(conn_id = %id, error = %e, "Broadcast send failed");
                self.failed += 1;
                self.failed_ids.push(id);
            }
        }
    }
}

type ConnectionMap<M, S> = BTreeMap<ConnectionId, Arc<Connection<M, S>>>;

/// Thread-safe map of live connections
///
/// Cloning shares the underlying map.
pub struct ConnectionRegistry<M, S = JsonSerializer> {
    inner: Arc<Mutex<ConnectionMap<M, S>>>,
}

impl<M, S> Default for ConnectionRegistry<M, S> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }
}

impl<M, S> Clone for ConnectionRegistry<M, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M, S> std::fmt::Debug for ConnectionRegistry<M, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

impl<M, S> ConnectionRegistry<M, S> {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection
    pub(crate) fn insert(&self, connection: Arc<Connection<M, S>>) {
        self.inner.lock().insert(connection.id(), connection);
    }

    /// Remove a connection, returning it if it was present
    pub(crate) fn remove(&self, id: ConnectionId) -> Option<Arc<Connection<M, S>>> {
        self.inner.lock().remove(&id)
    }

    /// Remove every connection, returning what was registered
    pub(crate) fn clear(&self) -> Vec<Arc<Connection<M, S>>> {
        std::mem::take(&mut *self.inner.lock())
            .into_values()
            .collect()
    }

    /// Look up a connection
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection<M, S>>> {
        self.inner.lock().get(&id).cloned()
    }

    /// Check if a connection is registered
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.lock().contains_key(&id)
    }

    /// Point-in-time copy of the registered connections, in id order
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Connection<M, S>>> {
        self.inner.lock().values().cloned().collect()
    }

    /// Registered connection IDs, in id order
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.inner.lock().keys().copied().collect()
    }

    /// Number of registered connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl<M, S> ConnectionRegistry<M, S>
where
    M: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: Serializer,
{
    /// Send a message to every registered connection
    ///
    /// A failed send is counted and the broadcast moves on.
    pub async fn broadcast(&self, message: &M) -> BroadcastResult {
        let mut result = BroadcastResult::default();
        for connection in self.snapshot() {
            result.record(connection.id(), connection.send(message).await);
        }
        result
    }

    /// Send raw bytes to every registered connection
    pub async fn broadcast_raw(&self, bytes: &[u8]) -> BroadcastResult {
        let mut result = BroadcastResult::default();
        for connection in self.snapshot() {
            result.record(connection.id(), connection.send_raw(bytes).await);
        }
        result
    }

    pub(crate) async fn broadcast_sentinel(&self, sentinel: Sentinel) -> BroadcastResult {
        let mut result = BroadcastResult::default();
        for connection in self.snapshot() {
            result.record(connection.id(), connection.send_sentinel(sentinel).await);
        }
        result
    }
}
