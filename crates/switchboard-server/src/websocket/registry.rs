//! Registry of live connections.
//!
//! Connections register under their id and deregister themselves when they
//! close. A newer connection under an existing id displaces the older one.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use switchboard_core::{ConnectionError, ConnectionId, ServerUpdate};
use tracing::debug;

use super::connection::{CloseReason, Connection};

type Entries = Arc<RwLock<HashMap<ConnectionId, Connection>>>;

/// Shared map of live connections keyed by id.
#[derive(Clone, Default)]
pub struct Registry {
    entries: Entries,
}

/// Non-owning link from a connection back to its registry.
#[derive(Clone)]
pub(crate) struct WeakRegistry(Weak<RwLock<HashMap<ConnectionId, Connection>>>);

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<Registry> {
        self.0.upgrade().map(|entries| Registry { entries })
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` under its id.
    ///
    /// Returns the connection it displaced, if any; the caller decides what
    /// to do with it. Fails with [`ConnectionError::Closed`] when `conn` has
    /// already started closing, so a closed connection is never left behind.
    pub fn insert(&self, conn: &Connection) -> Result<Option<Connection>, ConnectionError> {
        let mut entries = self.entries.write();
        conn.link_registry(WeakRegistry(Arc::downgrade(&self.entries)));
        // checked under the write lock: a concurrent close blocks on it to deregister
        if !conn.is_open() {
            conn.unlink_registry();
            return Err(ConnectionError::Closed);
        }
        let displaced = entries
            .insert(conn.id().clone(), conn.clone())
            .filter(|old| !old.ptr_eq(conn));
        if let Some(old) = &displaced {
            old.unlink_registry();
        }
        debug!(connection_id = %conn.id(), total = entries.len(), "connection registered");
        Ok(displaced)
    }

    /// Remove whatever is registered under `id`.
    pub fn remove(&self, id: &ConnectionId) -> Option<Connection> {
        let removed = self.entries.write().remove(id);
        if let Some(conn) = &removed {
            conn.unlink_registry();
        }
        removed
    }

    /// Remove `conn` only if it is still the entry for its id.
    pub(crate) fn remove_if_same(&self, conn: &Connection) -> bool {
        let mut entries = self.entries.write();
        if entries.get(conn.id()).is_some_and(|c| c.ptr_eq(conn)) {
            let _ = entries.remove(conn.id());
            debug!(connection_id = %conn.id(), total = entries.len(), "connection deregistered");
            true
        } else {
            false
        }
    }

    /// Connection registered under `id`.
    pub fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.entries.read().get(id).cloned()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Ids of all registered connections.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of all registered connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.entries.read().values().cloned().collect()
    }

    /// Open connections whose attribute `key` equals `value`.
    ///
    /// Works on a snapshot; the lock is not held while attributes are read.
    pub fn find_by_attribute(&self, key: &str, value: &Value) -> Vec<Connection> {
        self.connections()
            .into_iter()
            .filter(|c| c.is_open() && c.has_attribute(key, value))
            .collect()
    }

    /// Close the connection registered under `id`. Returns whether one was found.
    pub async fn close(&self, id: &ConnectionId) -> bool {
        let Some(conn) = self.get(id) else {
            return false;
        };
        conn.close_with(CloseReason::Evicted).await;
        true
    }

    /// Close every registered connection and wait for all of them.
    pub async fn close_all(&self) {
        let conns = self.connections();
        if conns.is_empty() {
            return;
        }
        debug!(count = conns.len(), "closing all connections");
        let _ = join_all(conns.iter().map(|c| c.close_with(CloseReason::Shutdown))).await;
    }

    /// Send a `{type, data}` envelope to every registered connection.
    pub async fn broadcast_update<T: Serialize>(
        &self,
        update_type: &str,
        data: T,
    ) -> Result<Vec<Delivery>, ConnectionError> {
        fan_out(&self.connections(), update_type, data).await
    }
}

/// Outcome of one fan-out write.
pub type Delivery = (ConnectionId, Result<(), ConnectionError>);

/// Send one `{type, data}` envelope to each of `targets`, encoding it once.
///
/// Returns one outcome per target, in target order. Fails without writing
/// anything when the envelope cannot be encoded.
pub async fn fan_out<T: Serialize>(
    targets: &[Connection],
    update_type: &str,
    data: T,
) -> Result<Vec<Delivery>, ConnectionError> {
    let text = serde_json::to_string(&ServerUpdate::new(update_type, data))
        .map_err(ConnectionError::Encode)?;
    debug!(update_type, recipients = targets.len(), "fan out update");

    let writes = targets.iter().map(|conn| {
        let text = text.clone();
        async move {
            let result = conn.write_text(text).await;
            if let Err(e) = &result {
                debug!(connection_id = %conn.id(), error = %e, "fan-out write failed");
            }
            (conn.id().clone(), result)
        }
    });
    Ok(join_all(writes).await)
}
