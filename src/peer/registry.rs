//! # Peer Registry
//!
//! Maps a peer's display name to the handle of its established connection.
//! The lock is only held for map reads and writes; callers copy a handle (or
//! the key set) out and do their I/O afterwards.
//!
//! Two peers that dial each other at the same moment end up with two
//! connections, one per direction. Both nodes keep the connection dialed by
//! the lexicographically smaller name, so they agree on which one survives.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Notify, RwLock};

use super::error::NodeError;

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed the peer
    Outbound,
    /// The peer dialed us
    Inbound,
}

/// Outcome of [`PeerRegistry::insert`].
#[derive(Debug)]
pub enum Insert {
    /// The name was free
    Added,
    /// The new connection took the name; this is the one it displaced
    Replaced(PeerHandle),
    /// The existing connection from the other direction keeps the name;
    /// this is the new handle, not registered
    Declined(PeerHandle),
}

/// Cloneable handle to one established connection.
///
/// Frames pushed through [`PeerHandle::send_frame`] are written in order by
/// the connection's writer task, so concurrent senders never interleave bytes.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    name: String,
    connection_id: u64,
    addr: SocketAddr,
    direction: Direction,
    outbound: mpsc::Sender<Vec<u8>>,
    close: Arc<Notify>,
}

impl PeerHandle {
    pub fn new(
        name: String,
        connection_id: u64,
        addr: SocketAddr,
        direction: Direction,
        outbound: mpsc::Sender<Vec<u8>>,
        close: Arc<Notify>,
    ) -> Self {
        Self {
            name,
            connection_id,
            addr,
            direction,
            outbound,
            close,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub(crate) fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Queue an encoded frame (delimiter included) for the writer task.
    pub async fn send_frame(&self, frame: Vec<u8>, wait: Duration) -> Result<(), NodeError> {
        self.outbound
            .send_timeout(frame, wait)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => NodeError::QueueFull(self.name.clone()),
                SendTimeoutError::Closed(_) => NodeError::Closed(self.name.clone()),
            })
    }

    /// Ask the connection's session to stop reading and tear down.
    ///
    /// Frames already queued are still written before the socket closes.
    pub fn close(&self) {
        self.close.notify_one();
    }
}

/// Concurrency-safe map of peer name to connection handle.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    /// Display name of the node owning this registry
    local_name: Arc<str>,
    peers: Arc<RwLock<HashMap<String, PeerHandle>>>,
}

impl PeerRegistry {
    pub fn new(local_name: &str) -> Self {
        Self {
            local_name: Arc::from(local_name),
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Name of the node that dialed `handle`'s connection.
    fn dialer<'a>(&'a self, handle: &'a PeerHandle) -> &'a str {
        match handle.direction {
            Direction::Outbound => &*self.local_name,
            Direction::Inbound => handle.name.as_str(),
        }
    }

    /// Register `handle` under its name.
    ///
    /// A connection in the same direction as the current entry replaces it
    /// (the peer reconnected). Between opposite directions the one dialed
    /// by the smaller name wins.
    pub async fn insert(&self, handle: PeerHandle) -> Insert {
        let mut peers = self.peers.write().await;

        let keep_existing = peers.get(&handle.name).is_some_and(|existing| {
            existing.direction != handle.direction
                && self.dialer(existing) < self.dialer(&handle)
        });
        if keep_existing {
            return Insert::Declined(handle);
        }

        match peers.insert(handle.name.clone(), handle) {
            Some(previous) => Insert::Replaced(previous),
            None => Insert::Added,
        }
    }

    pub async fn get(&self, name: &str) -> Option<PeerHandle> {
        self.peers.read().await.get(name).cloned()
    }

    /// Remove `name` only if it is still mapped to `connection_id`.
    pub async fn remove_if_current(&self, name: &str, connection_id: u64) -> Option<PeerHandle> {
        let mut peers = self.peers.write().await;
        match peers.get(name) {
            Some(handle) if handle.connection_id == connection_id => peers.remove(name),
            _ => None,
        }
    }

    /// Sorted copy of the registered names.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Copy of every handle, for broadcasting outside the lock.
    pub async fn handles(&self) -> Vec<PeerHandle> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Empty the registry, returning what it held.
    pub async fn drain(&self) -> Vec<PeerHandle> {
        self.peers.write().await.drain().map(|(_, handle)| handle).collect()
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(
        name: &str,
        connection_id: u64,
        direction: Direction,
    ) -> (PeerHandle, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(4);
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        (
            PeerHandle::new(
                name.to_string(),
                connection_id,
                addr,
                direction,
                tx,
                Arc::new(Notify::new()),
            ),
            rx,
        )
    }

    #[tokio::test]
    async fn test_reconnect_replaces_entry() {
        let registry = PeerRegistry::new("alice");
        let (first, _rx1) = handle("bob", 1, Direction::Inbound);
        let (second, _rx2) = handle("bob", 2, Direction::Inbound);

        assert!(matches!(registry.insert(first).await, Insert::Added));
        let evicted = match registry.insert(second).await {
            Insert::Replaced(evicted) => evicted,
            other => panic!("expected replacement, got {:?}", other),
        };

        assert_eq!(evicted.connection_id(), 1);
        assert_eq!(registry.names().await, vec!["bob"]);
        assert_eq!(registry.get("bob").await.unwrap().connection_id(), 2);
    }

    #[tokio::test]
    async fn test_crossed_connections_keep_smaller_dialer() {
        // alice < bob, so the connection alice dialed wins on both nodes,
        // whichever finished its handshake first.
        for alice_dialed_first in [true, false] {
            let at_alice = PeerRegistry::new("alice");
            let at_bob = PeerRegistry::new("bob");
            let (alice_out, _r1) = handle("bob", 1, Direction::Outbound);
            let (alice_in, _r2) = handle("bob", 2, Direction::Inbound);
            let (bob_in, _r3) = handle("alice", 3, Direction::Inbound);
            let (bob_out, _r4) = handle("alice", 4, Direction::Outbound);

            if alice_dialed_first {
                at_alice.insert(alice_out).await;
                assert!(matches!(
                    at_alice.insert(alice_in).await,
                    Insert::Declined(h) if h.connection_id() == 2
                ));
                at_bob.insert(bob_in).await;
                assert!(matches!(
                    at_bob.insert(bob_out).await,
                    Insert::Declined(h) if h.connection_id() == 4
                ));
            } else {
                at_alice.insert(alice_in).await;
                assert!(matches!(
                    at_alice.insert(alice_out).await,
                    Insert::Replaced(h) if h.connection_id() == 2
                ));
                at_bob.insert(bob_out).await;
                assert!(matches!(
                    at_bob.insert(bob_in).await,
                    Insert::Replaced(h) if h.connection_id() == 4
                ));
            }

            let kept_by_alice = at_alice.get("bob").await.unwrap();
            let kept_by_bob = at_bob.get("alice").await.unwrap();
            assert_eq!(kept_by_alice.direction(), Direction::Outbound);
            assert_eq!(kept_by_bob.direction(), Direction::Inbound);
        }
    }

    #[tokio::test]
    async fn test_stale_session_does_not_remove_newer_entry() {
        let registry = PeerRegistry::new("alice");
        let (first, _rx1) = handle("bob", 1, Direction::Inbound);
        let (second, _rx2) = handle("bob", 2, Direction::Inbound);
        registry.insert(first).await;
        registry.insert(second).await;

        assert!(registry.remove_if_current("bob", 1).await.is_none());
        assert_eq!(registry.len().await, 1);

        assert!(registry.remove_if_current("bob", 2).await.is_some());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_names_are_sorted_snapshot() {
        let registry = PeerRegistry::new("dave");
        let mut receivers = Vec::new();
        for (i, name) in ["carol", "alice", "bob"].iter().enumerate() {
            let (h, rx) = handle(name, i as u64, Direction::Outbound);
            receivers.push(rx);
            registry.insert(h).await;
        }

        let names = registry.names().await;
        registry.drain().await;

        assert_eq!(names, vec!["alice", "bob", "carol"]);
        assert!(registry.names().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_frame_reports_closed_and_full_queues() {
        let (tx, rx) = mpsc::channel(1);
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let peer = PeerHandle::new(
            "bob".into(),
            7,
            addr,
            Direction::Outbound,
            tx,
            Arc::new(Notify::new()),
        );

        peer.send_frame(b"a\n".to_vec(), Duration::from_millis(10)).await.unwrap();
        let full = peer.send_frame(b"b\n".to_vec(), Duration::from_millis(10)).await;
        assert!(matches!(full, Err(NodeError::QueueFull(name)) if name == "bob"));

        drop(rx);
        let closed = peer.send_frame(b"c\n".to_vec(), Duration::from_millis(10)).await;
        assert!(matches!(closed, Err(NodeError::Closed(_))));
    }
}
