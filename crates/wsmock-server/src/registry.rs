//! Per-instance registry of live client connections.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::watch;
use wsmock_core::ClientId;

use crate::connection::ConnectionHandle;

/// Point-in-time view of one registered client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    /// Client id.
    pub client_id: ClientId,
    /// Whether the connection is open right now.
    pub alive: bool,
}

/// Concurrent map of client id to connection handle.
///
/// Enumeration returns a snapshot; registrations racing with it may or may
/// not be included.
pub struct ConnectionRegistry {
    clients: DashMap<ClientId, Arc<ConnectionHandle>>,
    count: watch::Sender<usize>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            clients: DashMap::new(),
            count,
        }
    }

    /// Register a connection. Returns `false` if the id is already taken.
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> bool {
        let inserted = match self.clients.entry(handle.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let _ = slot.insert(handle);
                true
            }
        };
        if inserted {
            self.publish_count();
        }
        inserted
    }

    /// Remove a connection. Returns the removed handle, if any.
    pub fn unregister(&self, id: &str) -> Option<Arc<ConnectionHandle>> {
        let removed = self.clients.remove(id).map(|(_, handle)| handle);
        if removed.is_some() {
            self.publish_count();
        }
        removed
    }

    /// Look up a connection by id.
    pub fn lookup(&self, id: &str) -> Option<Arc<ConnectionHandle>> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every registered handle.
    pub fn handles(&self) -> Vec<Arc<ConnectionHandle>> {
        self.clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Snapshot of every registered client.
    pub fn list(&self) -> Vec<ClientInfo> {
        self.clients
            .iter()
            .map(|entry| ClientInfo {
                client_id: entry.key().clone(),
                alive: entry.value().is_alive(),
            })
            .collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Wait until at least `n` connections are registered.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_for_len(&self, n: usize, timeout: Duration) -> bool {
        let mut rx = self.count.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|count| *count >= n))
            .await
            .is_ok_and(|res| res.is_ok())
    }

    fn publish_count(&self) {
        // Read inside the watch lock so the last publisher reports a
        // length that includes every earlier map update.
        self.count.send_modify(|count| *count = self.clients.len());
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
