//! Peer connection table.
//!
//! Each open peer socket gets a bounded mpsc channel for backpressure; the
//! receiver is owned by the socket's write loop, the [`PeerHandle`] holds the
//! sender. The table routes by peer name: a newer connection for the same
//! name takes over new traffic (last one wins). The replaced socket is left
//! open, since two peers dialing each other at once would otherwise close
//! the socket the other side kept. It is tracked until it ends on its own
//! or is drained at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::config::ConnectionConfig;

/// Unique identifier for a connection, assigned by the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDirection {
    /// Accepted by this node's mesh endpoint.
    Inbound,
    /// Dialed by this node.
    Outbound,
}

/// Frame queued for a peer's write loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A JSON-encoded mesh frame.
    Text(String),
    /// Close the socket with an optional reason.
    Close(Option<String>),
}

/// Error returned when queueing a frame fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The channel stayed full for the whole timeout.
    Timeout,
    /// The write loop has exited.
    Disconnected,
}

/// Handle to one open peer socket.
#[derive(Debug)]
pub struct PeerHandle {
    pub id: ConnectionId,
    /// Remote service name, taken from the `x-service-name` header or the
    /// dialed name.
    pub service: String,
    pub direction: PeerDirection,
    pub connected_at: Instant,
    tx: mpsc::Sender<OutboundFrame>,
}

impl PeerHandle {
    /// Queues a frame without waiting. Returns `false` if the channel is
    /// full or closed.
    #[must_use]
    pub fn try_send(&self, frame: OutboundFrame) -> bool {
        self.tx.try_send(frame).is_ok()
    }

    /// Queues a frame, waiting up to `timeout` for channel capacity.
    ///
    /// # Errors
    ///
    /// `SendError::Timeout` if the channel stays full, `SendError::Disconnected`
    /// if the write loop is gone.
    pub async fn send_timeout(
        &self,
        frame: OutboundFrame,
        timeout: Duration,
    ) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Open peer connections keyed by service name.
#[derive(Debug)]
pub struct PeerTable {
    peers: DashMap<String, Arc<PeerHandle>>,
    replaced: DashMap<ConnectionId, Arc<PeerHandle>>,
    next_id: AtomicU64,
}

impl PeerTable {
    /// Connection IDs start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            replaced: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection for `service`, returning its handle and the
    /// receiver for the write loop. Any previous handle for the same name
    /// stops receiving new traffic but its socket is not closed.
    pub fn register(
        &self,
        service: &str,
        direction: PeerDirection,
        config: &ConnectionConfig,
    ) -> (Arc<PeerHandle>, mpsc::Receiver<OutboundFrame>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);
        let handle = Arc::new(PeerHandle {
            id,
            service: service.to_string(),
            direction,
            connected_at: Instant::now(),
            tx,
        });

        if let Some(previous) = self.peers.insert(service.to_string(), Arc::clone(&handle)) {
            self.replaced.insert(previous.id, previous);
        }
        (handle, rx)
    }

    /// Looks up `service`, ignoring handles whose write loop has exited.
    #[must_use]
    pub fn get(&self, service: &str) -> Option<Arc<PeerHandle>> {
        self.peers
            .get(service)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|handle| handle.is_connected())
    }

    #[must_use]
    pub fn is_connected(&self, service: &str) -> bool {
        self.get(service).is_some()
    }

    /// Forgets connection `id`, removing `service` only if its current
    /// handle is that connection. Returns `true` when the current handle
    /// was removed.
    ///
    /// A socket that closes after being replaced must not evict its
    /// replacement.
    pub fn remove_if_current(&self, service: &str, id: ConnectionId) -> bool {
        if self.replaced.remove(&id).is_some() {
            return false;
        }
        self.peers
            .remove_if(service, |_, handle| handle.id == id)
            .is_some()
    }

    /// Sorted names of connected peers.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .peers
            .iter()
            .filter(|entry| entry.value().is_connected())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.peers.len()
    }

    /// Replaced connections whose sockets are still open.
    #[must_use]
    pub fn replaced_count(&self) -> usize {
        self.replaced.len()
    }

    /// Removes and returns every handle, replaced ones included. Used
    /// during shutdown.
    pub fn drain_all(&self) -> Vec<Arc<PeerHandle>> {
        let keys: Vec<String> = self.peers.iter().map(|entry| entry.key().clone()).collect();
        let ids: Vec<ConnectionId> = self.replaced.iter().map(|entry| *entry.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.peers.remove(&key).map(|(_, handle)| handle))
            .chain(ids.into_iter().filter_map(|id| self.replaced.remove(&id).map(|(_, handle)| handle)))
            .collect()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: usize) -> ConnectionConfig {
        ConnectionConfig {
            outbound_channel_capacity: capacity,
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn register_and_lookup() {
        let table = PeerTable::new();
        let (handle, _rx) = table.register("orders", PeerDirection::Outbound, &config(4));

        assert_eq!(handle.id, ConnectionId(1));
        assert!(table.is_connected("orders"));
        assert!(!table.is_connected("billing"));
        assert_eq!(table.names(), vec!["orders"]);
    }

    #[test]
    fn last_connection_wins_and_leaves_previous_open() {
        let table = PeerTable::new();
        let (first, mut first_rx) = table.register("orders", PeerDirection::Outbound, &config(4));
        let (second, _rx) = table.register("orders", PeerDirection::Inbound, &config(4));

        assert_eq!(table.count(), 1);
        assert_eq!(table.get("orders").unwrap().id, second.id);
        assert!(first_rx.try_recv().is_err());
        assert!(first.is_connected());
        assert_eq!(table.replaced_count(), 1);

        // The replaced socket closing must not evict its successor.
        assert!(!table.remove_if_current("orders", first.id));
        assert_eq!(table.replaced_count(), 0);
        assert!(table.is_connected("orders"));
        assert!(table.remove_if_current("orders", second.id));
        assert!(!table.is_connected("orders"));
    }

    #[test]
    fn closed_handles_are_not_connected() {
        let table = PeerTable::new();
        let (handle, rx) = table.register("orders", PeerDirection::Inbound, &config(4));
        assert!(handle.is_connected());

        drop(rx);
        assert!(!handle.is_connected());
        assert!(table.get("orders").is_none());
        assert!(table.names().is_empty());
    }

    #[test]
    fn try_send_respects_capacity() {
        let table = PeerTable::new();
        let (handle, _rx) = table.register("orders", PeerDirection::Outbound, &config(2));

        assert!(handle.try_send(OutboundFrame::Text("1".into())));
        assert!(handle.try_send(OutboundFrame::Text("2".into())));
        assert!(!handle.try_send(OutboundFrame::Text("3".into())));
    }

    #[tokio::test]
    async fn send_timeout_reports_disconnect_and_full() {
        let table = PeerTable::new();
        let (handle, rx) = table.register("orders", PeerDirection::Outbound, &config(1));

        handle
            .send_timeout(OutboundFrame::Text("a".into()), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(
            handle
                .send_timeout(OutboundFrame::Text("b".into()), Duration::from_millis(10))
                .await,
            Err(SendError::Timeout)
        );

        drop(rx);
        assert_eq!(
            handle
                .send_timeout(OutboundFrame::Text("c".into()), Duration::from_millis(10))
                .await,
            Err(SendError::Disconnected)
        );
    }

    #[test]
    fn drain_all_empties_table() {
        let table = PeerTable::new();
        let (_a, _rx_a) = table.register("a", PeerDirection::Outbound, &config(1));
        let (_b, _rx_b) = table.register("b", PeerDirection::Inbound, &config(1));
        let (_b2, _rx_b2) = table.register("b", PeerDirection::Outbound, &config(1));

        assert_eq!(table.drain_all().len(), 3);
        assert_eq!(table.count(), 0);
        assert_eq!(table.replaced_count(), 0);
    }
}
