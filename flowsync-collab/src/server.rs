//! WebSocket sync server with room-based workflow routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── OperationFacade (automation)
//!             ├── Relay ── Room (workflow id) ── WorkflowDocument
//! Client B ──┘     │                     │
//!                  │                     └── BroadcastGroup ──► Client A, B, ...
//!                  │
//!                  └── DocumentRegistry ── PersistenceBridge ── SnapshotStore
//!                                                                (RocksDB | memory)
//! ```
//!
//! One task per connection multiplexes three sources with `select!`: frames
//! from the socket, events from the room's broadcast channel and the
//! heartbeat timer. A separate maintenance task checkpoints, prunes stale
//! presence and evicts idle rooms every `checkpoint_interval`.
//!
//! Handshake:
//! ```text
//! C → S  Join {user, summary}
//! S → C  SyncStep2 (what the client lacks)
//! S → C  SyncStep1 (server summary; the client answers with SyncStep2)
//! S → C  PeerJoined × existing peers
//! S → C  {"type": "states", ...}  (presence text frame)
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::broadcast::{Frame, RoomEvent};
use crate::config::ServerConfig;
use crate::error::CollabError;
use crate::facade::OperationFacade;
use crate::presence::PresenceFrame;
use crate::protocol::{MessageType, SyncMessage};
use crate::registry::{CheckpointReport, DocumentRegistry};
use crate::relay::{Relay, RelayStats};
use crate::storage::{
    BridgeStats, MemorySnapshotStore, PersistenceBridge, RetryPolicy, RocksSnapshotStore,
    SnapshotStore, StoreConfig,
};
use crate::templates::{InMemoryCatalog, TemplateCatalog};

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub resident_documents: usize,
    /// `(workflow id, connections)` for every resident room
    pub room_sizes: Vec<(String, usize)>,
    pub relay: RelayStats,
    pub persistence: BridgeStats,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// Aborts the wrapped task when dropped.
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    relay: Arc<Relay>,
    facade: Arc<OperationFacade>,
    counters: Arc<Counters>,
}

impl SyncServer {
    /// Create a server backed by RocksDB when `storage_path` is set and by
    /// an in-memory store otherwise. Must be called inside a tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self, CollabError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksSnapshotStore::open(StoreConfig::at(path.clone()))?),
            None => Arc::new(MemorySnapshotStore::new()),
        };
        Ok(Self::with_store(config, store, RetryPolicy::default()))
    }

    /// Create a server over an explicit store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>, policy: RetryPolicy) -> Self {
        let bridge = PersistenceBridge::new(store, policy);
        let registry = Arc::new(DocumentRegistry::new(bridge, config.broadcast_capacity));
        let relay = Arc::new(Relay::new(registry, config.clone()));
        let facade = Arc::new(OperationFacade::new(relay.clone(), Arc::new(InMemoryCatalog::new())));
        Self {
            config,
            relay,
            facade,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Replace the template catalog used by the facade.
    pub fn with_catalog(mut self, catalog: Arc<dyn TemplateCatalog>) -> Self {
        self.facade = Arc::new(OperationFacade::new(self.relay.clone(), catalog));
        self
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), CollabError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept WebSocket connections on `listener`. The maintenance task
    /// lives as long as this future.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), CollabError> {
        let addr = listener.local_addr()?;
        log::info!(
            "Sync server listening on {addr} (collaboration {})",
            if self.config.collaboration_enabled { "enabled" } else { "disabled" }
        );
        let _maintenance = TaskGuard(self.spawn_maintenance());

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            log::debug!("New TCP connection from {peer_addr}");

            let relay = self.relay.clone();
            let counters = self.counters.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                counters.total_connections.fetch_add(1, Ordering::Relaxed);
                counters.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = handle_connection(stream, peer_addr, &relay, &counters, &config).await {
                    log::error!("Connection error from {peer_addr}: {e}");
                }
                counters.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Spawn the periodic checkpoint / presence / eviction loop.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let relay = self.relay.clone();
        let period = self.config.checkpoint_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let report = relay.maintain().await;
                if report.checkpoints.written > 0 || !report.evicted.is_empty() {
                    log::debug!(
                        "Maintenance: {} checkpointed, {} presence pruned, {} evicted",
                        report.checkpoints.written,
                        report.presence_pruned,
                        report.evicted.len()
                    );
                }
            }
        })
    }

    /// Drain the journal and checkpoint every resident document.
    pub async fn flush(&self) -> CheckpointReport {
        let registry = self.relay.registry();
        registry.bridge().flush_journal().await;
        registry.checkpoint_all().await
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let room_sizes = self.relay.room_sizes().await;
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            active_rooms: room_sizes.iter().filter(|(_, n)| *n > 0).count(),
            resident_documents: room_sizes.len(),
            room_sizes,
            relay: self.relay.stats(),
            persistence: self.relay.registry().bridge().stats(),
        }
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub fn facade(&self) -> &Arc<OperationFacade> {
        &self.facade
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

async fn send_sync<S>(sink: &mut S, msg: &SyncMessage) -> Result<(), CollabError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    sink.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

async fn send_presence<S>(sink: &mut S, frame: &PresenceFrame) -> Result<(), CollabError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    sink.send(Message::Text(frame.to_json()?.into())).await?;
    Ok(())
}

/// Handle a single WebSocket connection until it closes.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    relay: &Relay,
    counters: &Counters,
    config: &ServerConfig,
) -> Result<(), CollabError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let conn = Uuid::new_v4();
    log::info!("WebSocket connection {conn} established from {addr}");

    let mut workflow_id: Option<String> = None;
    let mut room_rx: Option<tokio::sync::broadcast::Receiver<RoomEvent>> = None;
    let mut last_heard = Instant::now();
    let period = config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    let result: Result<(), CollabError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    last_heard = Instant::now();
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            counters.total_messages.fetch_add(1, Ordering::Relaxed);
                            counters.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                            let sync_msg = match SyncMessage::decode(&data) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };
                            match sync_msg.msg_type {
                                MessageType::Join => {
                                    let request = match sync_msg.join_request() {
                                        Ok(request) => request,
                                        Err(e) => {
                                            send_sync(&mut ws_sender, &SyncMessage::error(&sync_msg.doc_id, &e.to_string())).await?;
                                            continue;
                                        }
                                    };
                                    match relay.join(conn, &sync_msg.doc_id, request.user, &request.summary).await {
                                        Ok(outcome) => {
                                            let doc = sync_msg.doc_id.as_str();
                                            room_rx = Some(outcome.receiver);
                                            workflow_id = Some(doc.to_string());
                                            send_sync(&mut ws_sender, &SyncMessage::sync_step2(Uuid::nil(), doc, outcome.catch_up)).await?;
                                            send_sync(&mut ws_sender, &SyncMessage::sync_step1(Uuid::nil(), doc, outcome.server_summary)).await?;
                                            for peer in &outcome.peers {
                                                send_sync(&mut ws_sender, &SyncMessage::peer_joined(Uuid::nil(), doc, peer)?).await?;
                                            }
                                            send_presence(&mut ws_sender, &PresenceFrame::States { states: outcome.presence }).await?;
                                        }
                                        Err(e @ (CollabError::RoomFull { .. } | CollabError::CollaborationDisabled)) => {
                                            log::warn!("Refusing {conn} on {}: {e}", sync_msg.doc_id);
                                            send_sync(&mut ws_sender, &SyncMessage::error(&sync_msg.doc_id, &e.to_string())).await?;
                                            return Ok(());
                                        }
                                        Err(e) => {
                                            log::error!("Join of {conn} to {} failed: {e}", sync_msg.doc_id);
                                            send_sync(&mut ws_sender, &SyncMessage::error(&sync_msg.doc_id, &e.to_string())).await?;
                                        }
                                    }
                                }

                                // A SyncStep2 from the client answers the server's SyncStep1
                                MessageType::Delta | MessageType::SyncStep2 => {
                                    match relay.publish(conn, sync_msg.clock, &sync_msg.payload).await {
                                        Ok(_) => {}
                                        Err(e @ CollabError::NotJoined(_)) => {
                                            send_sync(&mut ws_sender, &SyncMessage::error(&sync_msg.doc_id, &e.to_string())).await?;
                                        }
                                        Err(e) => {
                                            send_sync(&mut ws_sender, &SyncMessage::error(&sync_msg.doc_id, &format!("delta rejected: {e}"))).await?;
                                        }
                                    }
                                }

                                MessageType::SyncStep1 => {
                                    match relay.catch_up(conn, &sync_msg.payload).await {
                                        Ok(diff) => {
                                            send_sync(&mut ws_sender, &SyncMessage::sync_step2(Uuid::nil(), &sync_msg.doc_id, diff)).await?;
                                        }
                                        Err(e) => {
                                            send_sync(&mut ws_sender, &SyncMessage::error(&sync_msg.doc_id, &e.to_string())).await?;
                                        }
                                    }
                                }

                                MessageType::Ping => {
                                    send_sync(&mut ws_sender, &SyncMessage::pong(Uuid::nil())).await?;
                                }

                                MessageType::Pong => {}

                                other => {
                                    log::debug!("Unhandled message type from {conn}: {other:?}");
                                }
                            }
                        }

                        Some(Ok(Message::Text(text))) => {
                            counters.total_messages.fetch_add(1, Ordering::Relaxed);
                            counters.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);
                            let doc = workflow_id.as_deref().unwrap_or_default();
                            match PresenceFrame::from_json(text.as_str()) {
                                Ok(PresenceFrame::Update { record }) => {
                                    if let Err(e) = relay.set_presence(conn, record).await {
                                        send_sync(&mut ws_sender, &SyncMessage::error(doc, &e.to_string())).await?;
                                    }
                                }
                                Ok(PresenceFrame::Query) => match relay.query_presence(conn).await {
                                    Ok(states) => send_presence(&mut ws_sender, &PresenceFrame::States { states }).await?,
                                    Err(e) => send_sync(&mut ws_sender, &SyncMessage::error(doc, &e.to_string())).await?,
                                },
                                Ok(other) => log::debug!("Ignoring server-side presence frame from {conn}: {other:?}"),
                                Err(e) => {
                                    log::warn!("Bad presence frame from {conn}: {e}");
                                    send_sync(&mut ws_sender, &SyncMessage::error(doc, &e.to_string())).await?;
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {conn} closed from {addr}");
                            return Ok(());
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }

                        Some(Ok(_)) => {}
                    }
                }

                event = async {
                    match room_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        // Not joined yet
                        None => std::future::pending().await,
                    }
                } => {
                    match event {
                        Ok(event) => {
                            // Don't echo back to sender
                            if event.origin == conn {
                                continue;
                            }
                            match event.frame {
                                Frame::Binary(bytes) => {
                                    ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                                }
                                Frame::Presence(json) => {
                                    ws_sender.send(Message::Text(json.as_str().to_owned().into())).await?;
                                }
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Connection {conn} lagged by {n} events; sending full state");
                            relay.record_lag(conn, n).await;
                            let state = relay.resync(conn).await?;
                            let doc = workflow_id.as_deref().unwrap_or_default();
                            send_sync(&mut ws_sender, &SyncMessage::sync_step2(Uuid::nil(), doc, state)).await?;
                        }
                        Err(RecvError::Closed) => return Ok(()),
                    }
                }

                _ = heartbeat.tick() => {
                    if last_heard.elapsed() > config.client_timeout {
                        log::info!("Connection {conn} timed out");
                        return Ok(());
                    }
                    send_sync(&mut ws_sender, &SyncMessage::ping(Uuid::nil())).await?;
                }
            }
        }
    }
    .await;

    relay.leave(conn).await;
    result
}
