//! Per-room fan-out to every connected peer.
//!
//! One tokio broadcast channel per room. Frames are encoded once and shared
//! as `Arc<Vec<u8>>`; each frame carries its sender so a connection task can
//! skip its own traffic without decoding it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// An encoded frame and the peer it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Frames skipped by receivers that fell behind.
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Fan-out group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before a slow peer
    /// starts losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Envelope> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode and send a message to every receiver, sender included.
    /// Returns the number of receivers.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(msg.peer_id, Arc::new(encoded)))
    }

    /// Send pre-encoded bytes.
    pub fn broadcast_raw(&self, from: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Envelope { from, bytes }).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
