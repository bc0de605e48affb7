use flowsync_core::DocumentError;
use thiserror::Error;

use crate::presence::PresenceError;
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Errors raised by the registry, relay and persistence bridge.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("workflow already exists: {0}")]
    WorkflowExists(String),
    /// The handle was evicted while the caller held it; reopen and retry.
    #[error("workflow {0} was evicted")]
    Evicted(String),
    #[error("room for workflow {workflow_id} is full ({limit} connections)")]
    RoomFull { workflow_id: String, limit: usize },
    #[error("collaboration is disabled")]
    CollaborationDisabled,
    #[error("connection {0} has not joined a workflow")]
    NotJoined(uuid::Uuid),
    #[error("checkpoint of {doc_id} failed after {attempts} attempts: {source}")]
    CheckpointExhausted {
        doc_id: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
