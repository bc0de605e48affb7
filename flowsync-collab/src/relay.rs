//! Transport relay: attaches connections to workflow rooms, merges their
//! deltas into the registry and fans them out to the rest of the room.
//!
//! The relay is transport-agnostic. [`crate::server::SyncServer`] drives it
//! from WebSocket connections; tests drive it directly.
//!
//! Per-sender order is preserved because each connection publishes
//! sequentially and the room channel is FIFO. Cross-sender order is not
//! constrained; merges commute.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowsync_core::{LocalChange, Mutation};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::broadcast::{AdmitError, RoomEvent};
use crate::config::ServerConfig;
use crate::error::CollabError;
use crate::presence::{now_millis, PresenceEntry, PresenceFrame, PresenceRecord};
use crate::protocol::{PeerInfo, SyncMessage};
use crate::registry::{CheckpointReport, DocumentHandle, DocumentRegistry};

/// Everything a connection needs right after joining.
pub struct JoinOutcome {
    /// Delta covering everything the client's summary lacked
    pub catch_up: Vec<u8>,
    /// The server's summary, so the client can send back what it alone has
    pub server_summary: Vec<u8>,
    /// Room events, subscribed before `catch_up` was computed
    pub receiver: broadcast::Receiver<RoomEvent>,
    /// Current presence records of the room
    pub presence: Vec<PresenceEntry>,
    /// Other connections already in the room
    pub peers: Vec<PeerInfo>,
}

/// Relay counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayStats {
    pub joins: u64,
    pub deltas_relayed: u64,
    pub deltas_rejected: u64,
    pub presence_updates: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    joins: AtomicU64,
    deltas_relayed: AtomicU64,
    deltas_rejected: AtomicU64,
    presence_updates: AtomicU64,
}

struct Attachment {
    workflow_id: String,
    handle: Arc<DocumentHandle>,
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub checkpoints: CheckpointReport,
    pub presence_pruned: usize,
    pub evicted: Vec<String>,
}

pub struct Relay {
    registry: Arc<DocumentRegistry>,
    config: ServerConfig,
    connections: RwLock<HashMap<Uuid, Attachment>>,
    stats: AtomicRelayStats,
}

impl Relay {
    pub fn new(registry: Arc<DocumentRegistry>, config: ServerConfig) -> Self {
        Self {
            registry,
            config,
            connections: RwLock::new(HashMap::new()),
            stats: AtomicRelayStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Attach `conn` to the room of `workflow_id` (created on demand).
    ///
    /// A connection that was already attached elsewhere leaves first. An
    /// empty or unreadable `summary` yields a full-state catch-up.
    pub async fn join(
        &self,
        conn: Uuid,
        workflow_id: &str,
        user: PeerInfo,
        summary: &[u8],
    ) -> Result<JoinOutcome, CollabError> {
        if !self.config.collaboration_enabled {
            return Err(CollabError::CollaborationDisabled);
        }
        if self.connections.read().await.contains_key(&conn) {
            self.leave(conn).await;
        }

        // A room closed for eviction sends us back to the registry, which
        // rehydrates the workflow.
        let (handle, receiver) = loop {
            let handle = self.registry.open(workflow_id).await?;
            match handle
                .room()
                .try_add_peer(conn, user.clone(), self.config.max_clients_per_room)
                .await
            {
                Ok(receiver) => break (handle, receiver),
                Err(AdmitError::Closed) => tokio::task::yield_now().await,
                Err(AdmitError::Full) => {
                    return Err(CollabError::RoomFull {
                        workflow_id: workflow_id.to_string(),
                        limit: self.config.max_clients_per_room,
                    })
                }
            }
        };
        handle.touch();

        let catch_up = match handle.catch_up(summary) {
            Ok(delta) => delta,
            Err(e) => {
                log::warn!("Unreadable summary from {conn} for {workflow_id}: {e}; sending full state");
                handle.encode_state()
            }
        };
        let server_summary = handle.state_summary();
        let presence = handle.presence().entries();
        let peers = handle
            .room()
            .peer_entries()
            .await
            .into_iter()
            .filter(|(id, _)| *id != conn)
            .map(|(_, info)| info)
            .collect();

        self.connections.write().await.insert(
            conn,
            Attachment {
                workflow_id: workflow_id.to_string(),
                handle: handle.clone(),
            },
        );
        self.stats.joins.fetch_add(1, Ordering::Relaxed);

        let joined = SyncMessage::peer_joined(conn, workflow_id, &user)?;
        handle.room().broadcast(conn, &joined)?;
        log::info!("{} ({conn}) joined {workflow_id}", user.user_name);

        Ok(JoinOutcome {
            catch_up,
            server_summary,
            receiver,
            presence,
            peers,
        })
    }

    async fn attachment(&self, conn: Uuid) -> Result<(String, Arc<DocumentHandle>), CollabError> {
        self.connections
            .read()
            .await
            .get(&conn)
            .map(|a| (a.workflow_id.clone(), a.handle.clone()))
            .ok_or(CollabError::NotJoined(conn))
    }

    /// Workflow a connection is attached to.
    pub async fn workflow_of(&self, conn: Uuid) -> Option<String> {
        self.connections.read().await.get(&conn).map(|a| a.workflow_id.clone())
    }

    /// Merge a client delta and fan it out to the rest of the room.
    ///
    /// Corrupt deltas are dropped, logged and reported to the caller; the
    /// document is untouched.
    pub async fn publish(&self, conn: Uuid, clock: u64, delta: &[u8]) -> Result<u64, CollabError> {
        let (workflow_id, handle) = self.attachment(conn).await?;
        let version = match handle.apply_remote(delta) {
            Ok(version) => version,
            Err(e) => {
                self.stats.deltas_rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping delta from {conn} for {workflow_id}: {e}");
                return Err(e);
            }
        };
        self.registry.journal(&workflow_id, version, delta.to_vec());
        handle
            .room()
            .broadcast(conn, &SyncMessage::delta(conn, &workflow_id, clock, delta.to_vec()))?;
        self.stats.deltas_relayed.fetch_add(1, Ordering::Relaxed);
        Ok(version)
    }

    /// Apply a server-side mutation and fan it out like a client delta.
    pub async fn publish_local(&self, workflow_id: &str, mutation: &Mutation) -> Result<LocalChange, CollabError> {
        let (handle, applied) = self.registry.apply_local_change(workflow_id, mutation).await?;
        let msg = SyncMessage::delta(Uuid::nil(), workflow_id, applied.version, applied.delta.clone());
        handle.room().broadcast(Uuid::nil(), &msg)?;
        log::debug!("{} applied to {workflow_id} at v{}", mutation.kind(), applied.version);
        Ok(LocalChange {
            delta: applied.delta,
            state_summary: applied.state_summary,
        })
    }

    /// Delta bringing `conn` up to date from `summary` (answer to `SyncStep1`).
    pub async fn catch_up(&self, conn: Uuid, summary: &[u8]) -> Result<Vec<u8>, CollabError> {
        let (_, handle) = self.attachment(conn).await?;
        handle.catch_up(summary)
    }

    /// Full state, for a connection whose receiver lagged.
    pub async fn resync(&self, conn: Uuid) -> Result<Vec<u8>, CollabError> {
        let (workflow_id, handle) = self.attachment(conn).await?;
        log::warn!("Resynchronizing lagging connection {conn} on {workflow_id}");
        Ok(handle.encode_state())
    }

    /// Record that `conn`'s receiver skipped `n` events.
    pub async fn record_lag(&self, conn: Uuid, n: u64) {
        if let Ok((_, handle)) = self.attachment(conn).await {
            handle.room().record_lag(n);
        }
    }

    /// Replace `conn`'s presence and rebroadcast it.
    pub async fn set_presence(&self, conn: Uuid, record: PresenceRecord) -> Result<PresenceRecord, CollabError> {
        let (workflow_id, handle) = self.attachment(conn).await?;
        let stored = handle.presence().set(conn, record)?;
        let frame = PresenceFrame::Changed {
            connection_id: conn,
            record: stored.clone(),
        };
        handle.room().broadcast_presence(conn, frame.to_json()?);
        self.stats.presence_updates.fetch_add(1, Ordering::Relaxed);
        log::trace!("Presence of {conn} updated in {workflow_id}");
        Ok(stored)
    }

    /// Remove `conn`'s presence; `true` if it had one.
    pub async fn clear_presence(&self, conn: Uuid) -> bool {
        let Ok((_, handle)) = self.attachment(conn).await else {
            return false;
        };
        Self::clear_presence_in(&handle, conn)
    }

    fn clear_presence_in(handle: &DocumentHandle, conn: Uuid) -> bool {
        if handle.presence().remove(&conn).is_none() {
            return false;
        }
        match (PresenceFrame::Removed { connection_id: conn }).to_json() {
            Ok(json) => {
                handle.room().broadcast_presence(conn, json);
            }
            Err(e) => log::error!("Could not encode presence removal for {conn}: {e}"),
        }
        true
    }

    /// All presence records of `conn`'s room.
    pub async fn query_presence(&self, conn: Uuid) -> Result<Vec<PresenceEntry>, CollabError> {
        let (_, handle) = self.attachment(conn).await?;
        Ok(handle.presence().entries())
    }

    /// Most recent record per user in `conn`'s room.
    pub async fn presence_by_user(&self, conn: Uuid) -> Result<Vec<PresenceRecord>, CollabError> {
        let (_, handle) = self.attachment(conn).await?;
        Ok(handle.presence().by_user())
    }

    /// Detach `conn`, clear its presence and tell the room.
    pub async fn leave(&self, conn: Uuid) -> bool {
        let Some(attachment) = self.connections.write().await.remove(&conn) else {
            return false;
        };
        let handle = attachment.handle;
        handle.room().remove_peer(&conn).await;
        Self::clear_presence_in(&handle, conn);
        if let Err(e) = handle
            .room()
            .broadcast(conn, &SyncMessage::peer_left(conn, &attachment.workflow_id))
        {
            log::error!("Could not announce departure of {conn}: {e}");
        }
        // Idle time for eviction starts now
        handle.touch();
        log::info!("{conn} left {}", attachment.workflow_id);
        true
    }

    /// Connections attached to `workflow_id`.
    pub async fn room_connections(&self, workflow_id: &str) -> usize {
        match self.registry.get(workflow_id).await {
            Some(handle) => handle.room().peer_count().await,
            None => 0,
        }
    }

    /// Connection count of every resident room.
    pub async fn room_sizes(&self) -> Vec<(String, usize)> {
        let mut sizes = Vec::new();
        for handle in self.registry.handles().await {
            sizes.push((handle.id().to_string(), handle.room().peer_count().await));
        }
        sizes.sort();
        sizes
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Drop presence records not refreshed within `timeout`.
    pub async fn prune_presence(&self, timeout: Duration) -> usize {
        let now = now_millis();
        let timeout_ms = timeout.as_millis() as u64;
        let mut pruned = 0;
        for handle in self.registry.handles().await {
            let stale = handle.presence().prune_stale(now, timeout_ms);
            for conn in stale {
                pruned += 1;
                if let Ok(json) = (PresenceFrame::Removed { connection_id: conn }).to_json() {
                    handle.room().broadcast_presence(Uuid::nil(), json);
                }
            }
        }
        pruned
    }

    /// Checkpoint dirty documents, prune stale presence, evict idle rooms.
    pub async fn maintain(&self) -> MaintenanceReport {
        let checkpoints = self.registry.checkpoint_all().await;
        let presence_pruned = self.prune_presence(self.config.client_timeout).await;
        let evicted = self.registry.evict_idle(self.config.idle_grace).await;
        if !checkpoints.failed.is_empty() {
            log::error!(
                "{} workflow(s) could not be checkpointed: {:?}",
                checkpoints.failed.len(),
                checkpoints.failed
            );
        }
        MaintenanceReport {
            checkpoints,
            presence_pruned,
            evicted,
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            joins: self.stats.joins.load(Ordering::Relaxed),
            deltas_relayed: self.stats.deltas_relayed.load(Ordering::Relaxed),
            deltas_rejected: self.stats.deltas_rejected.load(Ordering::Relaxed),
            presence_updates: self.stats.presence_updates.load(Ordering::Relaxed),
        }
    }
}
