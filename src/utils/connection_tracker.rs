//! Connection tracking & graceful draining utilities.
//!
//! Every accepted TCP connection is registered for the lifetime of its
//! handling task. During shutdown the tracker can wait for the registered
//! connections to finish, bounded by a timeout.
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use scc::HashMap;
use tokio::time::sleep;

/// Unique identifier for a connection
pub type ConnectionId = u64;

/// Information about an active connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub established_at: Instant,
}

impl ConnectionInfo {
    pub fn new(id: ConnectionId, remote_addr: SocketAddr) -> Self {
        Self {
            id,
            remote_addr,
            established_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }
}

/// Tracks live connections and supports bounded draining.
#[derive(Clone)]
pub struct ConnectionTracker {
    connections: Arc<HashMap<ConnectionId, Arc<ConnectionInfo>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionTracker {
    /// Create a new empty tracker.
    pub fn new() -> Self {
        Self {
            connections: Arc::new(HashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a new connection and return an Arc to its info record.
    pub async fn register_connection(&self, remote_addr: SocketAddr) -> Arc<ConnectionInfo> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = Arc::new(ConnectionInfo::new(id, remote_addr));

        let _ = self.connections.insert_async(id, info.clone()).await;

        tracing::debug!(
            "Connection registered: id={}, remote_addr={}, total_connections={}",
            id,
            remote_addr,
            self.connections.len()
        );

        info
    }

    /// Remove (unregister) a connection by id.
    pub async fn unregister_connection(&self, connection_id: ConnectionId) {
        if let Some((_, info)) = self.connections.remove_async(&connection_id).await {
            tracing::debug!(
                "Connection unregistered: id={}, age={:?}, total_connections={}",
                connection_id,
                info.age(),
                self.connections.len()
            );
        }
    }

    /// Current number of active (registered) connections.
    pub fn active_connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Wait until no connection is registered or the timeout elapses.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut check_interval = Duration::from_millis(10);

        loop {
            let remaining = self.connections.len();
            if remaining == 0 {
                tracing::info!("All connections drained successfully");
                return true;
            }
            if start.elapsed() >= timeout {
                tracing::warn!(
                    "Drain timeout exceeded: {} connections still open after {:?}",
                    remaining,
                    timeout
                );
                return false;
            }

            tracing::debug!(
                "Waiting for connections to drain: {} remaining, elapsed: {:?}",
                remaining,
                start.elapsed()
            );

            sleep(check_interval.min(timeout.saturating_sub(start.elapsed()))).await;

            // Exponential backoff up to 1 second
            check_interval = std::cmp::min(check_interval * 2, Duration::from_secs(1));
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_connection_registration() {
        let tracker = ConnectionTracker::new();
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();

        let conn = tracker.register_connection(addr).await;
        assert_eq!(conn.remote_addr, addr);
        assert_eq!(tracker.active_connection_count(), 1);

        let second = tracker.register_connection(addr).await;
        assert_ne!(conn.id, second.id);

        tracker.unregister_connection(conn.id).await;
        tracker.unregister_connection(conn.id).await;
        assert_eq!(tracker.active_connection_count(), 1);
    }

    #[tokio::test]
    async fn test_drain_functionality() {
        let tracker = ConnectionTracker::new();
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();

        let conn = tracker.register_connection(addr).await;

        // Should not drain while the connection is registered
        assert!(!tracker.wait_for_drain(Duration::from_millis(50)).await);

        let background = tracker.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            background.unregister_connection(conn.id).await;
        });
        assert!(tracker.wait_for_drain(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_empty_tracker_drains_immediately() {
        let tracker = ConnectionTracker::new();
        assert!(tracker.wait_for_drain(Duration::ZERO).await);
    }
}
