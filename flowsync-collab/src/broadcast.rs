//! Fan-out of room events to every connection of a workflow room.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each
//! connection owns an independent receiver buffering up to `capacity`
//! events, so a slow connection lags only itself. Binary sync frames and
//! presence frames share the channel, which keeps their relative order per
//! sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Payload of a room event, pre-encoded once for all receivers.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Encoded [`SyncMessage`]
    Binary(Arc<Vec<u8>>),
    /// Presence frame JSON
    Presence(Arc<String>),
}

/// One fanned-out event. `origin` is the publishing connection, or nil
/// for server-originated edits (facade, maintenance).
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub origin: Uuid,
    pub frame: Frame,
}

/// Why [`BroadcastGroup::try_add_peer`] refused a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitError {
    /// The room already holds its peer limit.
    Full,
    /// The room was closed for eviction; reopen the workflow and retry.
    Closed,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_peers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

/// The broadcast group of a single workflow room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomEvent>,
    /// Connected peers, keyed by connection id
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    /// Only written while `peers` is write-locked
    closed: AtomicBool,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many events a receiver may fall behind before it
    /// observes `Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            capacity,
            atomic_stats: AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_lagged: AtomicU64::new(0),
            },
        }
    }

    /// Register a connection unless the room is closed or already holds
    /// `limit` peers.
    ///
    /// The receiver is subscribed while the peer table is locked, so it
    /// sees every event published after the peer became visible.
    pub async fn try_add_peer(
        &self,
        conn: Uuid,
        info: PeerInfo,
        limit: usize,
    ) -> Result<broadcast::Receiver<RoomEvent>, AdmitError> {
        let mut peers = self.peers.write().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdmitError::Closed);
        }
        if !peers.contains_key(&conn) && peers.len() >= limit {
            return Err(AdmitError::Full);
        }
        peers.insert(conn, info);
        Ok(self.sender.subscribe())
    }

    /// Close the room if nobody is in it. Once closed, every later
    /// [`try_add_peer`](Self::try_add_peer) fails with [`AdmitError::Closed`]
    /// until [`reopen`](Self::reopen).
    pub async fn close_if_empty(&self) -> bool {
        let peers = self.peers.write().await;
        if !peers.is_empty() {
            return false;
        }
        self.closed.store(true, Ordering::SeqCst);
        true
    }

    pub async fn reopen(&self) {
        let _peers = self.peers.write().await;
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn remove_peer(&self, conn: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(conn)
    }

    /// Encode once and fan out; the caller's own receiver gets it too and
    /// filters by `origin`.
    pub fn broadcast(&self, origin: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        Ok(self.send(RoomEvent {
            origin,
            frame: Frame::Binary(encoded),
        }))
    }

    pub fn broadcast_presence(&self, origin: Uuid, json: String) -> usize {
        self.send(RoomEvent {
            origin,
            frame: Frame::Presence(Arc::new(json)),
        })
    }

    fn send(&self, event: RoomEvent) -> usize {
        let count = self.sender.send(event).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a receiver skipped `n` events.
    pub fn record_lag(&self, n: u64) {
        self.atomic_stats.messages_lagged.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Peers together with their connection ids.
    pub async fn peer_entries(&self) -> Vec<(Uuid, PeerInfo)> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(conn, info)| (*conn, info.clone()))
            .collect()
    }

    pub async fn has_peer(&self, conn: &Uuid) -> bool {
        self.peers.read().await.contains_key(conn)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.atomic_stats.messages_lagged.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw receiver without registering a peer.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.sender.subscribe()
    }
}
