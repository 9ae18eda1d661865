//! Live-connection registry, used for close fan-out at shutdown.

use std::sync::Arc;

use dashmap::DashMap;

use super::Connection;

#[derive(Default)]
pub struct ConnRegistry {
    conns: DashMap<u64, Arc<Connection>>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
        }
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.conns.insert(conn.id(), conn);
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Connection>> {
        self.conns.remove(&id).map(|(_, c)| c)
    }

    pub fn get(&self, id: u64) -> Option<Arc<Connection>> {
        self.conns.get(&id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Signal close on every tracked connection. Each connection's own loops
    /// observe the signal and run teardown (which removes it from here).
    pub fn close_all(&self) {
        for entry in self.conns.iter() {
            entry.value().close();
        }
    }
}
