//! # flowsync-collab: Real-time collaboration for workflow documents
//!
//! Hosts one CRDT-backed [`flowsync_core::WorkflowDocument`] per workflow,
//! relays deltas between WebSocket peers, tracks presence, persists
//! checkpoints, and exposes a request/response operation facade that edits
//! the same live documents.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (replica)   │  binary + presence  │ (accept)    │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!        ┌──────────────────┐         ┌──────┴──────┐
//!        │ OperationFacade  │ ──────► │    Relay    │
//!        │ (JSON ops)       │         │ (rooms)     │
//!        └──────────────────┘         └──┬───────┬──┘
//!                                        │       │
//!                     ┌──────────────────┴┐     ┌┴───────────────┐
//!                     │ DocumentRegistry  │     │ BroadcastGroup │
//!                     │ + PresenceRoom    │     │ (fan-out)      │
//!                     └─────────┬─────────┘     └────────────────┘
//!                               │
//!                     ┌─────────┴─────────┐
//!                     │ PersistenceBridge │
//!                     │ journal + ckpt    │
//!                     └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Room fan-out with per-receiver backpressure
//! - [`presence`]: Ephemeral per-connection presence records
//! - [`storage`]: Snapshot stores (RocksDB, memory) and the persistence bridge
//! - [`registry`]: Resident documents, hydration and checkpointing
//! - [`relay`]: Room membership, delta relay and maintenance
//! - [`templates`]: Node template catalog
//! - [`facade`]: Named JSON operations over live documents
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client with reconnect

pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod facade;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod storage;
pub mod templates;

// Re-exports for convenience
pub use broadcast::{AdmitError, BroadcastGroup, BroadcastStats, Frame, RoomEvent};
pub use client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
pub use config::ServerConfig;
pub use error::CollabError;
pub use facade::{FacadeError, OperationFacade, WorkflowState};
pub use presence::{Cursor, PresenceEntry, PresenceError, PresenceFrame, PresenceRecord, PresenceRoom};
pub use protocol::{JoinRequest, MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use registry::{CheckpointReport, DocumentHandle, DocumentRegistry};
pub use relay::{JoinOutcome, MaintenanceReport, Relay, RelayStats};
pub use server::{ServerStats, SyncServer};
pub use storage::{
    BridgeStats, MemorySnapshotStore, PersistenceBridge, RetryPolicy, RocksSnapshotStore,
    SnapshotStore, StoreConfig, StoreError,
};
pub use templates::{InMemoryCatalog, NodeTemplate, PortDirection, TemplateCatalog};
