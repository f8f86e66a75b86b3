//! Connection Registry
//!
//! The set of live handlers, keyed by connection id. Iteration always works on
//! a snapshot so fan-out never holds the lock while enqueueing.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use super::handler::ConnectionHandler;
use super::types::{ConnectionId, ConnectionInfo};

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    handlers: RwLock<HashMap<ConnectionId, Arc<ConnectionHandler>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a handler. Returns `false` if its id is already present.
    pub fn add(&self, handler: Arc<ConnectionHandler>) -> bool {
        let id = handler.id();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&id) {
            debug_assert!(false, "connection {id} registered twice");
            return false;
        }
        handlers.insert(id, handler);
        debug!(connection_id = %id, active = handlers.len(), "Connection registered");
        true
    }

    /// Stop tracking a handler. Removing an absent id is a no-op.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandler>> {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let removed = handlers.remove(&id);
        if removed.is_some() {
            debug!(connection_id = %id, active = handlers.len(), "Connection unregistered");
        }
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Copy of the current membership
    pub fn snapshot(&self) -> Vec<Arc<ConnectionHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Remove and return every handler
    pub fn drain(&self) -> Vec<Arc<ConnectionHandler>> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handler)| handler)
            .collect()
    }

    /// Status of every live connection, ordered by id
    pub fn infos(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self.snapshot().iter().map(|h| h.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
