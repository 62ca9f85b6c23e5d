//! Registry of connections currently being served

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// What is known about a live connection
#[derive(Debug, Clone)]
pub struct LiveConnection {
    /// Remote address, if it could be read
    pub peer_addr: Option<String>,
    /// When the connection was handed to the handler
    pub accepted_at: Instant,
}

/// Thread-safe set of live connections keyed by a numeric id
#[derive(Debug, Default)]
pub struct LiveConnections {
    map: DashMap<u64, LiveConnection>,
    next_id: AtomicU64,
}

impl LiveConnections {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection; it is removed when the guard drops
    pub(crate) fn track(self: &Arc<Self>, peer_addr: Option<String>) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.map.insert(
            id,
            LiveConnection {
                peer_addr,
                accepted_at: Instant::now(),
            },
        );
        ConnectionGuard {
            id,
            registry: Arc::clone(self),
        }
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no connection is live
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Snapshot of the live connections
    pub fn snapshot(&self) -> Vec<(u64, LiveConnection)> {
        let mut entries: Vec<_> = self
            .map
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }
}

/// Removes its connection from [`LiveConnections`] on drop
#[derive(Debug)]
pub(crate) struct ConnectionGuard {
    id: u64,
    registry: Arc<LiveConnections>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.map.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_removes_entry() {
        let live = Arc::new(LiveConnections::new());
        let first = live.track(Some("127.0.0.1:1".into()));
        let second = live.track(None);
        assert_eq!(live.len(), 2);

        drop(first);
        let remaining = live.snapshot();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].1.peer_addr.is_none());

        drop(second);
        assert!(live.is_empty());
    }
}
