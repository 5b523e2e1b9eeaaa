//! Connection statistics shared by the acceptor, the HTTP proxy and the
//! admin API.
//!
//! Every accepted socket is registered and handed a [`ConnectionGuard`]. The
//! guard walks the connection through connecting → connected → closed and keeps
//! the counters consistent: a connection counts as failed at most once, never
//! after it was counted as successful, and closing is idempotent (dropping the
//! guard closes it).
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use scc::HashMap;
use serde::Serialize;

use crate::metrics;

/// Unique identifier for a connection
pub type ConnectionId = u64;

/// Process-wide connection counters and client lists.
pub struct ConnectionTracker {
    received: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    connecting: HashMap<ConnectionId, String>,
    connected: HashMap<ConnectionId, String>,
    connection_timeout_ms: AtomicU64,
    next_id: AtomicU64,
}

impl ConnectionTracker {
    pub fn new(connection_timeout: Duration) -> Self {
        Self {
            received: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            connecting: HashMap::new(),
            connected: HashMap::new(),
            connection_timeout_ms: AtomicU64::new(duration_millis(connection_timeout)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Record an accepted client and return the guard tracking it.
    pub fn register(self: &Arc<Self>, remote_addr: SocketAddr) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.received.fetch_add(1, Ordering::Relaxed);
        let _ = self.connecting.insert(id, remote_addr.to_string());
        metrics::increment_connection_attempts();
        self.publish_active();

        tracing::debug!(
            connection_id = id,
            %remote_addr,
            connecting = self.connecting.len(),
            "Connection registered"
        );

        ConnectionGuard {
            tracker: Arc::clone(self),
            id,
            state: GuardState::Connecting,
        }
    }

    /// How long a connection may take to identify its protocol.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms.load(Ordering::Relaxed))
    }

    /// Change the detection timeout; applies to connections accepted afterwards.
    pub fn set_connection_timeout(&self, timeout: Duration) {
        self.connection_timeout_ms
            .store(duration_millis(timeout), Ordering::Relaxed);
        tracing::info!(timeout = ?timeout, "Connection timeout updated");
    }

    pub fn received_connection_attempts(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn successful_connection_attempts(&self) -> u64 {
        self.successful.load(Ordering::Relaxed)
    }

    pub fn failed_connection_attempts(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Clients still identifying their protocol or waiting for a backend.
    pub fn connecting_clients(&self) -> Vec<String> {
        collect_clients(&self.connecting)
    }

    /// Clients currently relayed to a backend.
    pub fn connected_clients(&self) -> Vec<String> {
        collect_clients(&self.connected)
    }

    pub fn active_connection_count(&self) -> usize {
        self.connecting.len() + self.connected.len()
    }

    pub fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            received_connection_attempts: self.received_connection_attempts(),
            successful_connection_attempts: self.successful_connection_attempts(),
            failed_connection_attempts: self.failed_connection_attempts(),
            connecting_clients: self.connecting_clients(),
            connected_clients: self.connected_clients(),
            connection_timeout_ms: self.connection_timeout_ms.load(Ordering::Relaxed),
        }
    }

    fn publish_active(&self) {
        metrics::set_active_connections(self.active_connection_count());
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn collect_clients(map: &HashMap<ConnectionId, String>) -> Vec<String> {
    let mut clients = Vec::with_capacity(map.len());
    map.scan(|_, client| clients.push(client.clone()));
    clients.sort();
    clients
}

/// Read-only view of the connection statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub received_connection_attempts: u64,
    pub successful_connection_attempts: u64,
    pub failed_connection_attempts: u64,
    pub connecting_clients: Vec<String>,
    pub connected_clients: Vec<String>,
    pub connection_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardState {
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Tracks one client connection; closes it on drop.
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
    id: ConnectionId,
    state: GuardState,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Backend reached: move the client from connecting to connected.
    pub fn connected(&mut self, client: impl Into<String>) {
        if self.state != GuardState::Connecting {
            return;
        }
        self.state = GuardState::Connected;
        let tracker = &self.tracker;
        tracker.connecting.remove(&self.id);
        let _ = tracker.connected.insert(self.id, client.into());
        tracker.successful.fetch_add(1, Ordering::Relaxed);
        metrics::increment_connections_successful();
        tracker.publish_active();
    }

    /// Count this connection as failed. Only the first call while connecting
    /// has an effect.
    pub fn fail(&mut self, reason: &'static str) {
        if self.state != GuardState::Connecting {
            return;
        }
        self.state = GuardState::Failed;
        let tracker = &self.tracker;
        tracker.connecting.remove(&self.id);
        tracker.failed.fetch_add(1, Ordering::Relaxed);
        metrics::increment_connections_failed(reason);
        tracker.publish_active();
        tracing::debug!(connection_id = self.id, reason, "Connection attempt failed");
    }

    /// Remove the client from every list. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.state == GuardState::Closed {
            return;
        }
        self.state = GuardState::Closed;
        let tracker = &self.tracker;
        tracker.connecting.remove(&self.id);
        tracker.connected.remove(&self.id);
        tracker.publish_active();
        tracing::trace!(connection_id = self.id, "Connection closed");
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.close();
    }
}
