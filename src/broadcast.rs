//! Fan-out broadcast to the peers of one room.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers; each
//! peer gets an independent receiver buffering up to `capacity` frames.
//! The sender is included in the fan-out — filtering out a peer's own
//! frames by `conn_id` is the connection loop's job.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    /// Broadcast channel sender
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Connected peers in this room
    peers: Arc<RwLock<HashSet<Uuid>>>,
    /// Channel capacity (frames buffered per receiver)
    capacity: usize,
    /// Lock-free send counter
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    ///
    /// `capacity` determines how many frames can be buffered per peer
    /// before a lagging peer starts dropping messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashSet::new())),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Add a peer, returning its receiver.
    pub async fn add_peer(&self, conn_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(conn_id);
        self.sender.subscribe()
    }

    /// Remove a peer from this broadcast group.
    pub async fn remove_peer(&self, conn_id: &Uuid) -> bool {
        let mut peers = self.peers.write().await;
        peers.remove(conn_id)
    }

    /// Encode and broadcast a message to all subscribed peers.
    ///
    /// Returns the number of receivers that got the frame.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes directly (zero-copy fast path).
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Current peer count.
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Check if a peer is connected.
    pub async fn has_peer(&self, conn_id: &Uuid) -> bool {
        self.peers.read().await.contains(conn_id)
    }

    /// Broadcast statistics snapshot.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    /// Channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe without registering a peer (server-side taps).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_remove_peer() {
        let group = BroadcastGroup::new(16);
        let conn = Uuid::new_v4();

        let _rx = group.add_peer(conn).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&conn).await);

        assert!(group.remove_peer(&conn).await);
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.has_peer(&conn).await);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_all_peers() {
        let group = BroadcastGroup::new(16);

        let mut rx1 = group.add_peer(Uuid::new_v4()).await;
        let mut rx2 = group.add_peer(Uuid::new_v4()).await;
        let mut rx3 = group.add_peer(Uuid::new_v4()).await;

        let msg = SyncMessage::delta(Uuid::new_v4(), "room-abc123", 1, vec![1, 2, 3]);
        let count = group.broadcast(&msg).unwrap();
        // All receivers get it, the sender included — filtering is the
        // connection loop's job.
        assert_eq!(count, 3);

        let _ = rx1.recv().await.unwrap();
        let _ = rx2.recv().await.unwrap();
        let _ = rx3.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_raw_zero_copy() {
        let group = BroadcastGroup::new(16);
        let mut rx = group.add_peer(Uuid::new_v4()).await;

        let data = Arc::new(vec![10, 20, 30]);
        let count = group.broadcast_raw(data.clone());
        assert_eq!(count, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(*received, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_stats() {
        let group = BroadcastGroup::new(16);
        let conn = Uuid::new_v4();
        let _rx = group.add_peer(conn).await;

        let msg = SyncMessage::ping(conn);
        group.broadcast(&msg).unwrap();
        group.broadcast(&msg).unwrap();

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_capacity() {
        let group = BroadcastGroup::new(32);
        assert_eq!(group.capacity(), 32);
    }
}
