//! Binary protocol for workflow delta synchronization.
//!
//! Wire format (bincode-encoded, standard config):
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id       │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ len + utf-8  │ varint   │ variable │
//! └──────────┴───────────┴──────────────┴──────────┴──────────┘
//! ```
//!
//! `doc_id` is the workflow id; graph identity travels inside the payload.
//! Presence does not use this format: it rides JSON text frames (see
//! [`crate::presence::PresenceFrame`]).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::presence::user_color;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Join a workflow room; payload is a [`JoinRequest`]
    Join = 1,
    /// State summary; the receiver answers with `SyncStep2`
    SyncStep1 = 2,
    /// Catch-up delta computed from a `SyncStep1` summary
    SyncStep2 = 3,
    /// Incremental delta
    Delta = 4,
    /// Peer joined notification
    PeerJoined = 5,
    /// Peer left notification
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
    /// Server-side rejection; payload is a UTF-8 reason
    Error = 9,
}

/// Identity a connection presents when joining.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub user_id: String,
    pub user_name: String,
    /// CSS hex color used for cursors and selections
    pub user_color: String,
}

impl PeerInfo {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let user_color = user_color(&user_id).to_string();
        Self {
            user_id,
            user_name: user_name.into(),
            user_color,
        }
    }

    /// Anonymous identity for a connection that never announced one.
    pub fn anonymous(peer_id: Uuid) -> Self {
        Self::new(peer_id.to_string(), "Anonymous")
    }
}

/// Payload of a [`MessageType::Join`] message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinRequest {
    pub user: PeerInfo,
    /// The client's state summary; empty for a fresh client
    pub summary: Vec<u8>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Connection that produced the message (nil for the server)
    pub peer_id: Uuid,
    /// Workflow id
    pub doc_id: String,
    /// Per-sender sequence number
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, doc_id: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id: doc_id.to_string(),
            clock,
            payload,
        }
    }

    pub fn join(peer_id: Uuid, doc_id: &str, request: &JoinRequest) -> Result<Self, ProtocolError> {
        let payload = encode_payload(request)?;
        Ok(Self::new(MessageType::Join, peer_id, doc_id, 0, payload))
    }

    /// Create a delta update message.
    pub fn delta(peer_id: Uuid, doc_id: &str, clock: u64, delta: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, doc_id, clock, delta)
    }

    /// Create a sync step 1 (state summary).
    pub fn sync_step1(peer_id: Uuid, doc_id: &str, summary: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, doc_id, 0, summary)
    }

    /// Create a sync step 2 (catch-up delta).
    pub fn sync_step2(peer_id: Uuid, doc_id: &str, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, doc_id, 0, diff)
    }

    pub fn peer_joined(peer_id: Uuid, doc_id: &str, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = encode_payload(info)?;
        Ok(Self::new(MessageType::PeerJoined, peer_id, doc_id, 0, payload))
    }

    pub fn peer_left(peer_id: Uuid, doc_id: &str) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, doc_id, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    pub fn error(doc_id: &str, reason: &str) -> Self {
        Self::new(MessageType::Error, Uuid::nil(), doc_id, 0, reason.as_bytes().to_vec())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    /// Parse a join payload.
    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Reason carried by an error message.
    pub fn error_reason(&self) -> Result<String, ProtocolError> {
        if self.msg_type != MessageType::Error {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
    #[error("Rejected by server: {0}")]
    Rejected(String),
}
