//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - A local [`WorkflowDocument`] replica kept in sync with the room
//! - Presence updates
//!
//! Edits made while disconnected stay in the replica. Reconnecting is an
//! ordinary join: the server answers the stale summary with what the
//! client missed and asks, through `SyncStep1`, for what it alone has.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use flowsync_core::{LocalChange, Mutation, WorkflowDocument, WorkflowSnapshot};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::error::CollabError;
use crate::presence::{PresenceFrame, PresenceRecord};
use crate::protocol::{JoinRequest, MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::storage::RetryPolicy;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established and initial catch-up applied
    Connected,
    /// Connection lost
    Disconnected,
    /// A remote change was merged into the replica
    RemoteChange { peer_id: Uuid },
    /// The replica was brought up to date by a catch-up delta
    Synced,
    /// A peer joined the room
    PeerJoined(PeerInfo),
    /// A peer left the room
    PeerLeft(Uuid),
    /// Presence traffic from the room
    Presence(PresenceFrame),
    /// The server rejected something this client sent
    ServerError(String),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// A join that has not received its catch-up within this is abandoned
    pub handshake_timeout: Duration,
    /// Backoff between connection attempts
    pub retry: RetryPolicy,
    /// Capacity of the event channel
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            event_capacity: 256,
        }
    }
}

/// The sync client.
pub struct SyncClient {
    user: PeerInfo,
    workflow_id: String,
    server_url: String,
    config: ClientConfig,
    /// Identifies this client in outgoing messages
    peer_id: Uuid,
    document: Arc<Mutex<WorkflowDocument>>,
    state: Arc<RwLock<ConnectionState>>,
    /// Sequence number of outgoing deltas
    clock: AtomicU64,
    /// Bumped per session; a reader task only reports its own session's end
    session: Arc<AtomicU64>,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

/// Best effort: a full channel drops the event and never stalls the reader.
fn emit(events: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = events.try_send(event) {
        log::debug!("Event channel full; dropping {event:?}");
    }
}

fn lock(document: &Mutex<WorkflowDocument>) -> MutexGuard<'_, WorkflowDocument> {
    document.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncClient {
    /// Create a client with an empty replica; the first join fills it.
    pub fn new(user: PeerInfo, workflow_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self::with_config(user, workflow_id, server_url, ClientConfig::default())
    }

    pub fn with_config(
        user: PeerInfo,
        workflow_id: impl Into<String>,
        server_url: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        // One actor per replica, even when a user holds several
        let peer_id = Uuid::new_v4();
        let document = WorkflowDocument::new(format!("{}:{}", user.user_id, peer_id.simple()));
        Self {
            user,
            workflow_id: workflow_id.into(),
            server_url: server_url.into(),
            config,
            peer_id,
            document: Arc::new(Mutex::new(document)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: AtomicU64::new(0),
            session: Arc::new(AtomicU64::new(0)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the workflow room and apply the catch-up.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), CollabError> {
        self.connect_as(ConnectionState::Connecting).await
    }

    /// Connect, retrying with exponential backoff. A rejection by the
    /// server (room full, collaboration disabled) is not retried.
    pub async fn connect_with_retry(&mut self) -> Result<(), CollabError> {
        let mut delay = self.config.retry.initial_delay;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let as_state = if attempt == 1 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            };
            match self.connect_as(as_state).await {
                Ok(()) => return Ok(()),
                Err(e @ CollabError::Protocol(ProtocolError::Rejected(_))) => return Err(e),
                Err(e) if attempt < self.config.retry.max_attempts => {
                    log::warn!("Connection attempt {attempt} to {} failed: {e}", self.server_url);
                    *self.state.write().await = ConnectionState::Reconnecting;
                    tokio::time::sleep(delay).await;
                    delay = self.config.retry.next_delay(delay);
                }
                Err(e) => {
                    log::error!("Giving up on {} after {attempt} attempts: {e}", self.server_url);
                    return Err(e);
                }
            }
        }
    }

    /// Drop the current connection (if any) and join again.
    pub async fn reconnect(&mut self) -> Result<(), CollabError> {
        self.session.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Reconnecting;
        self.connect_with_retry().await
    }

    async fn connect_as(&mut self, as_state: ConnectionState) -> Result<(), CollabError> {
        *self.state.write().await = as_state;
        match self.open_session().await {
            Ok(()) => {
                *self.state.write().await = ConnectionState::Connected;
                emit(&self.event_tx, SyncEvent::Connected);
                log::info!("Joined {} as {}", self.workflow_id, self.user.user_name);
                Ok(())
            }
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn open_session(&mut self) -> Result<(), CollabError> {
        let timeout = self.config.handshake_timeout;
        let (ws_stream, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(&self.server_url))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let join = JoinRequest {
            user: self.user.clone(),
            summary: lock(&self.document).state_summary(),
        };
        let join_msg = SyncMessage::join(self.peer_id, &self.workflow_id, &join)?;
        ws_writer.send(Message::Binary(join_msg.encode()?.into())).await?;

        tokio::time::timeout(timeout, await_catch_up(&mut ws_reader, &self.document))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        emit(&self.event_tx, SyncEvent::Synced);

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: merge remote changes and surface events
        let session = Session {
            peer_id: self.peer_id,
            workflow_id: self.workflow_id.clone(),
            document: self.document.clone(),
            outgoing: out_tx.clone(),
            events: self.event_tx.clone(),
        };
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let current = self.session.clone();
        let generation = current.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(sync_msg) => session.handle(sync_msg).await,
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Text(text)) => match PresenceFrame::from_json(text.as_str()) {
                        Ok(frame) => emit(&event_tx, SyncEvent::Presence(frame)),
                        Err(e) => log::warn!("Bad presence frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }

            // Connection lost, unless a newer session already replaced this one
            if current.load(Ordering::SeqCst) == generation {
                *state.write().await = ConnectionState::Disconnected;
                emit(&event_tx, SyncEvent::Disconnected);
            }
        });

        self.outgoing_tx = Some(out_tx);
        Ok(())
    }

    /// Close the connection. The replica is kept.
    pub async fn disconnect(&mut self) {
        self.session.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
            emit(&self.event_tx, SyncEvent::Disconnected);
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Apply a mutation to the replica and send its delta when connected.
    pub async fn apply_local(&self, mutation: &Mutation) -> Result<LocalChange, CollabError> {
        let change = lock(&self.document).apply_local(mutation)?;
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        if self.connection_state().await == ConnectionState::Connected {
            let msg = SyncMessage::delta(self.peer_id, &self.workflow_id, clock, change.delta.clone());
            self.send(Message::Binary(msg.encode()?.into())).await?;
        } else {
            log::debug!("Offline; {} kept in the replica until the next join", mutation.kind());
        }
        Ok(change)
    }

    /// Publish this connection's presence. Dropped silently when offline.
    pub async fn set_presence(&self, record: PresenceRecord) -> Result<(), CollabError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        let json = PresenceFrame::Update { record }.to_json()?;
        self.send(Message::Text(json.into())).await
    }

    /// Ask the server for every presence record of the room; the answer
    /// arrives as a [`SyncEvent::Presence`].
    pub async fn query_presence(&self) -> Result<(), CollabError> {
        let json = PresenceFrame::Query.to_json()?;
        self.send(Message::Text(json.into())).await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), CollabError> {
        let msg = SyncMessage::ping(self.peer_id);
        self.send(Message::Binary(msg.encode()?.into())).await
    }

    async fn send(&self, msg: Message) -> Result<(), CollabError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(msg).await.map_err(|_| ProtocolError::ConnectionClosed)?;
        Ok(())
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        lock(&self.document).snapshot()
    }

    pub fn state_summary(&self) -> Vec<u8> {
        lock(&self.document).state_summary()
    }

    /// Shared handle to the replica.
    pub fn document(&self) -> Arc<Mutex<WorkflowDocument>> {
        self.document.clone()
    }

    pub fn user(&self) -> &PeerInfo {
        &self.user
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Sequence number of the last delta sent or kept offline.
    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }
}

/// Read frames until the join's catch-up arrives and apply it.
async fn await_catch_up<R>(reader: &mut R, document: &Mutex<WorkflowDocument>) -> Result<(), CollabError>
where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = reader.next().await {
        match msg? {
            Message::Binary(data) => {
                let msg = SyncMessage::decode(&data)?;
                match msg.msg_type {
                    MessageType::SyncStep2 => {
                        lock(document).apply_remote(&msg.payload)?;
                        return Ok(());
                    }
                    MessageType::Error => {
                        return Err(ProtocolError::Rejected(msg.error_reason()?).into());
                    }
                    _ => {}
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(ProtocolError::ConnectionClosed.into())
}

/// State shared with the reader task.
struct Session {
    peer_id: Uuid,
    workflow_id: String,
    document: Arc<Mutex<WorkflowDocument>>,
    outgoing: mpsc::Sender<Message>,
    events: mpsc::Sender<SyncEvent>,
}

impl Session {
    async fn handle(&self, msg: SyncMessage) {
        let event = match msg.msg_type {
            MessageType::Delta => self.merge(&msg, SyncEvent::RemoteChange { peer_id: msg.peer_id }),
            MessageType::SyncStep2 => self.merge(&msg, SyncEvent::Synced),
            MessageType::SyncStep1 => {
                // Send back whatever the server lacks
                let diff = lock(&self.document).diff_since(&msg.payload);
                match diff {
                    Ok(diff) => {
                        let reply = SyncMessage::sync_step2(self.peer_id, &self.workflow_id, diff);
                        self.send(reply).await;
                    }
                    Err(e) => log::warn!("Unreadable server summary: {e}"),
                }
                None
            }
            MessageType::PeerJoined => msg.peer_info().ok().map(SyncEvent::PeerJoined),
            MessageType::PeerLeft => Some(SyncEvent::PeerLeft(msg.peer_id)),
            MessageType::Ping => {
                self.send(SyncMessage::pong(self.peer_id)).await;
                None
            }
            MessageType::Error => {
                let reason = msg.error_reason().unwrap_or_default();
                log::warn!("Server error on {}: {reason}", self.workflow_id);
                Some(SyncEvent::ServerError(reason))
            }
            MessageType::Join | MessageType::Pong => None,
        };
        if let Some(event) = event {
            emit(&self.events, event);
        }
    }

    fn merge(&self, msg: &SyncMessage, event: SyncEvent) -> Option<SyncEvent> {
        match lock(&self.document).apply_remote(&msg.payload) {
            Ok(()) => Some(event),
            Err(e) => {
                log::warn!("Dropping remote delta from {}: {e}", msg.peer_id);
                None
            }
        }
    }

    async fn send(&self, msg: SyncMessage) {
        match msg.encode() {
            Ok(encoded) => {
                let _ = self.outgoing.send(Message::Binary(encoded.into())).await;
            }
            Err(e) => log::error!("Could not encode {:?}: {e}", msg.msg_type),
        }
    }
}
