//! Ephemeral presence (cursor, selection, identity) per workflow room.
//!
//! Presence never enters the CRDT document or the durable store. Each
//! connection owns one record; a user with several connections is shown by
//! its most recently updated record while every connection keeps its own
//! entry for cleanup on disconnect.
//!
//! ```text
//! client ── {"type":"update", record} ──► PresenceRoom::set()
//!                                              │ stamped lastSeen
//!                                              ▼
//!                     room broadcast ── {"type":"changed", connectionId, record}
//! disconnect ──────────────────────────► PresenceRoom::remove()
//!                                              ▼
//!                     room broadcast ── {"type":"removed", connectionId}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Largest accepted record, measured as serialized JSON.
pub const MAX_PRESENCE_BYTES: usize = 50_000;

const PALETTE: [&str; 8] = [
    "#ef4444", "#f59e0b", "#10b981", "#3b82f6", "#8b5cf6", "#ec4899", "#06b6d4", "#84cc16",
];

/// Deterministic display color for a user id.
pub fn user_color(user_id: &str) -> &'static str {
    let mut hash: u32 = 0;
    for byte in user_id.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(byte as u32);
    }
    PALETTE[(hash as usize) % PALETTE.len()]
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Cursor location in graph (world) coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub graph_id: String,
    pub x: f64,
    pub y: f64,
}

/// One connection's presence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_color: Option<String>,
    #[serde(default)]
    pub cursor: Option<Cursor>,
    /// Selected node ids
    #[serde(default)]
    pub selection: Vec<String>,
    /// Stamped by the server on every update
    #[serde(default)]
    pub last_seen: u64,
}

impl PresenceRecord {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            user_color: None,
            cursor: None,
            selection: Vec::new(),
            last_seen: 0,
        }
    }

    pub fn with_cursor(mut self, graph_id: impl Into<String>, x: f64, y: f64) -> Self {
        self.cursor = Some(Cursor {
            graph_id: graph_id.into(),
            x,
            y,
        });
        self
    }

    pub fn with_selection(mut self, node_ids: Vec<String>) -> Self {
        self.selection = node_ids;
        self
    }
}

/// A record together with the connection that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub connection_id: Uuid,
    pub record: PresenceRecord,
}

/// JSON text frames exchanged on the presence channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PresenceFrame {
    /// Client replaces its own record
    Update { record: PresenceRecord },
    /// Client asks for every record in the room
    Query,
    /// Server answer to `Query` and initial state after join
    States { states: Vec<PresenceEntry> },
    /// Server notification of a replaced record
    Changed {
        connection_id: Uuid,
        record: PresenceRecord,
    },
    /// Server notification of a departed connection
    Removed { connection_id: Uuid },
}

impl PresenceFrame {
    pub fn to_json(&self) -> Result<String, PresenceError> {
        serde_json::to_string(self).map_err(|e| PresenceError::Malformed(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, PresenceError> {
        serde_json::from_str(text).map_err(|e| PresenceError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PresenceError {
    #[error("presence record is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("presence record has an empty userId")]
    MissingUser,
    #[error("malformed presence frame: {0}")]
    Malformed(String),
}

/// Presence records of one room, keyed by connection.
#[derive(Debug, Default)]
pub struct PresenceRoom {
    records: HashMap<Uuid, PresenceRecord>,
}

impl PresenceRoom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `conn`'s record, returning the stored (stamped) copy.
    pub fn set(&mut self, conn: Uuid, record: PresenceRecord) -> Result<PresenceRecord, PresenceError> {
        self.set_at(conn, record, now_millis())
    }

    pub fn set_at(
        &mut self,
        conn: Uuid,
        mut record: PresenceRecord,
        now_ms: u64,
    ) -> Result<PresenceRecord, PresenceError> {
        if record.user_id.is_empty() {
            return Err(PresenceError::MissingUser);
        }
        let size = serde_json::to_vec(&record)
            .map_err(|e| PresenceError::Malformed(e.to_string()))?
            .len();
        if size > MAX_PRESENCE_BYTES {
            return Err(PresenceError::TooLarge {
                size,
                limit: MAX_PRESENCE_BYTES,
            });
        }
        if record.user_color.as_deref().map_or(true, str::is_empty) {
            record.user_color = Some(user_color(&record.user_id).to_string());
        }
        // Monotonic per connection even if the wall clock steps back
        let previous = self.records.get(&conn).map_or(0, |r| r.last_seen);
        record.last_seen = now_ms.max(previous);
        self.records.insert(conn, record.clone());
        Ok(record)
    }

    /// Clear a connection's record.
    pub fn remove(&mut self, conn: &Uuid) -> Option<PresenceRecord> {
        self.records.remove(conn)
    }

    pub fn get(&self, conn: &Uuid) -> Option<&PresenceRecord> {
        self.records.get(conn)
    }

    /// Every per-connection entry.
    pub fn entries(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self
            .records
            .iter()
            .map(|(conn, record)| PresenceEntry {
                connection_id: *conn,
                record: record.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        entries
    }

    /// The most recently updated record of each user, sorted by user id.
    pub fn by_user(&self) -> Vec<PresenceRecord> {
        let mut latest: HashMap<&str, &PresenceRecord> = HashMap::new();
        for record in self.records.values() {
            match latest.get(record.user_id.as_str()) {
                Some(current) if current.last_seen >= record.last_seen => {}
                _ => {
                    latest.insert(record.user_id.as_str(), record);
                }
            }
        }
        let mut users: Vec<PresenceRecord> = latest.into_values().cloned().collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    /// Drop records not refreshed within `timeout_ms`; returns their connections.
    pub fn prune_stale(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<Uuid> {
        let stale: Vec<Uuid> = self
            .records
            .iter()
            .filter(|(_, r)| now_ms.saturating_sub(r.last_seen) > timeout_ms)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in &stale {
            self.records.remove(conn);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
