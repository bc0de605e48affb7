//! Durable storage for workflow documents.
//!
//! ```text
//! ┌──────────────────┐  appendUpdate (async journal)  ┌────────────────┐
//! │ DocumentRegistry │ ─────────────────────────────► │ SnapshotStore  │
//! │ (in-memory docs) │  putSnapshot (checkpoint)      │ memory | rocks │
//! └────────┬─────────┘ ─────────────────────────────► └───────┬────────┘
//!          │ hydrate: snapshot + updates since                │
//!          ◄──────────────────────────────────────────────────┘
//! ```
//!
//! Blobs are opaque to the store: full document states for snapshots,
//! single deltas for journaled updates. Versions increase monotonically per
//! document.

pub mod bridge;
pub mod memory;
pub mod rocks;

use thiserror::Error;

pub use bridge::{BridgeStats, Hydrated, PersistenceBridge, RetryPolicy};
pub use memory::MemorySnapshotStore;
pub use rocks::{RocksSnapshotStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
    #[error("Corrupt record for {doc_id}: {reason}")]
    Corrupt { doc_id: String, reason: String },
    #[error("Invalid document id {0:?}")]
    InvalidKey(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Versioned blob store holding checkpoints and the update journal.
///
/// Calls are synchronous and expected to be short; callers on the async
/// side never hold a document lock across them.
pub trait SnapshotStore: Send + Sync {
    /// Replace the checkpoint of `doc_id`.
    fn put_snapshot(&self, doc_id: &str, blob: &[u8], version: u64) -> Result<(), StoreError>;

    /// Latest checkpoint and its version.
    fn get_snapshot(&self, doc_id: &str) -> Result<Option<(Vec<u8>, u64)>, StoreError>;

    /// Journal one accepted delta.
    fn append_update(&self, doc_id: &str, version: u64, delta: &[u8]) -> Result<(), StoreError>;

    /// Journaled deltas with version `>= from_version`, in version order.
    fn updates_since(&self, doc_id: &str, from_version: u64) -> Result<Vec<(u64, Vec<u8>)>, StoreError>;

    /// Drop journaled deltas with version `<= up_to`; returns how many went.
    fn compact_updates(&self, doc_id: &str, up_to: u64) -> Result<u64, StoreError>;

    /// Whether anything is stored for `doc_id`.
    fn contains(&self, doc_id: &str) -> Result<bool, StoreError> {
        if self.get_snapshot(doc_id)?.is_some() {
            return Ok(true);
        }
        Ok(!self.updates_since(doc_id, 0)?.is_empty())
    }
}
