use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Viewer,
    Controller,
}

/// Bookkeeping of live peers, used for logging and status only.
///
/// Connection tasks never look each other up through the registry.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, (ConnectionKind, SocketAddr)>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track a peer until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, kind: ConnectionKind, peer: SocketAddr) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, (kind, peer));
        ConnectionGuard {
            id,
            registry: Arc::clone(self),
        }
    }

    pub fn count(&self, kind: ConnectionKind) -> usize {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    pub fn peers(&self, kind: ConnectionKind) -> Vec<SocketAddr> {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|(k, _)| *k == kind)
            .map(|(_, addr)| *addr)
            .collect()
    }
}

/// Removes its connection from the registry on drop, whatever the exit path.
pub struct ConnectionGuard {
    id: u64,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}
