//! Snapshot/persistence bridge: the only path between live documents and
//! the durable [`SnapshotStore`].
//!
//! - Accepted deltas are journaled by a background writer task; the merge
//!   path only enqueues.
//! - `checkpoint` writes a full state plus version, then compacts the
//!   journal up to that version.
//! - `hydrate` loads the checkpoint and replays journaled deltas newer than
//!   it.
//!
//! Store failures are retried with exponential backoff; exhausted retries
//! are logged at error level and counted in [`BridgeStats`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowsync_core::WorkflowDocument;
use tokio::sync::{mpsc, oneshot};

use super::{SnapshotStore, StoreError};
use crate::error::CollabError;

/// Exponential backoff for store writes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
    /// Growth factor after each failure
    pub multiplier: f64,
    /// Total attempts, including the first
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Millisecond delays, for tests.
    pub fn for_testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
            max_attempts: 3,
        }
    }

    /// The delay after `current`, clamped to `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_delay)
    }
}

/// Counters for operators.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BridgeStats {
    pub journal_appends: u64,
    pub journal_failures: u64,
    pub checkpoints_written: u64,
    pub checkpoint_failures: u64,
    pub updates_compacted: u64,
}

#[derive(Default)]
struct AtomicBridgeStats {
    journal_appends: AtomicU64,
    journal_failures: AtomicU64,
    checkpoints_written: AtomicU64,
    checkpoint_failures: AtomicU64,
    updates_compacted: AtomicU64,
}

enum JournalCommand {
    Append {
        doc_id: String,
        version: u64,
        delta: Vec<u8>,
    },
    Flush(oneshot::Sender<()>),
}

/// Result of [`PersistenceBridge::hydrate`].
pub struct Hydrated {
    pub document: WorkflowDocument,
    /// Highest version covered by the checkpoint or the replayed journal
    pub version: u64,
    /// Version of the checkpoint the document was built from
    pub checkpoint_version: u64,
}

#[derive(Clone)]
pub struct PersistenceBridge {
    store: Arc<dyn SnapshotStore>,
    journal: mpsc::UnboundedSender<JournalCommand>,
    policy: RetryPolicy,
    stats: Arc<AtomicBridgeStats>,
}

impl PersistenceBridge {
    /// Create the bridge and spawn its journal writer. Must be called
    /// inside a tokio runtime.
    pub fn new(store: Arc<dyn SnapshotStore>, policy: RetryPolicy) -> Self {
        let (journal, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(AtomicBridgeStats::default());
        tokio::spawn(journal_writer(store.clone(), rx, policy.clone(), stats.clone()));
        Self {
            store,
            journal,
            policy,
            stats,
        }
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Queue a delta for the journal; never waits on storage.
    pub fn journal(&self, doc_id: &str, version: u64, delta: Vec<u8>) {
        let command = JournalCommand::Append {
            doc_id: doc_id.to_string(),
            version,
            delta,
        };
        if self.journal.send(command).is_err() {
            log::error!("Journal writer stopped; update {doc_id} v{version} not journaled");
            self.stats.journal_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Wait until everything queued so far has been written (or given up on).
    pub async fn flush_journal(&self) {
        let (tx, rx) = oneshot::channel();
        if self.journal.send(JournalCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Whether the store holds anything for `doc_id`.
    pub fn contains(&self, doc_id: &str) -> Result<bool, CollabError> {
        Ok(self.store.contains(doc_id)?)
    }

    /// Rebuild a document from its checkpoint plus newer journal entries.
    /// `None` when nothing is stored.
    pub fn hydrate(&self, doc_id: &str, actor: &str) -> Result<Option<Hydrated>, CollabError> {
        let snapshot = self.store.get_snapshot(doc_id)?;
        let checkpoint_version = snapshot.as_ref().map_or(0, |(_, v)| *v);
        let updates = self.store.updates_since(doc_id, checkpoint_version + 1)?;
        if snapshot.is_none() && updates.is_empty() {
            return Ok(None);
        }

        let mut document = match &snapshot {
            Some((state, _)) => WorkflowDocument::from_state(actor, state)?,
            None => WorkflowDocument::new(actor),
        };
        let mut version = checkpoint_version;
        let mut replayed = 0usize;
        for (v, delta) in updates {
            match document.apply_remote(&delta) {
                Ok(()) => replayed += 1,
                Err(e) => log::warn!("Skipping corrupt journal entry {doc_id} v{v}: {e}"),
            }
            version = version.max(v);
        }
        log::info!(
            "Hydrated {doc_id} from checkpoint v{checkpoint_version} + {replayed} journaled updates"
        );
        Ok(Some(Hydrated {
            document,
            version,
            checkpoint_version,
        }))
    }

    /// Write a full checkpoint at `version`, retrying with backoff, then
    /// compact the journal up to it.
    pub async fn checkpoint(&self, doc_id: &str, state: &[u8], version: u64) -> Result<(), CollabError> {
        let mut delay = self.policy.initial_delay;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.put_snapshot(doc_id, state, version) {
                Ok(()) => break,
                Err(e) if attempt < self.policy.max_attempts => {
                    log::warn!("Checkpoint of {doc_id} v{version} failed (attempt {attempt}): {e}");
                    tokio::time::sleep(delay).await;
                    delay = self.policy.next_delay(delay);
                }
                Err(e) => {
                    log::error!(
                        "Checkpoint of {doc_id} v{version} failed after {attempt} attempts: {e}; \
                         edits since the last checkpoint live only in the journal"
                    );
                    self.stats.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(CollabError::CheckpointExhausted {
                        doc_id: doc_id.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
        self.stats.checkpoints_written.fetch_add(1, Ordering::Relaxed);

        match self.store.compact_updates(doc_id, version) {
            Ok(n) => {
                self.stats.updates_compacted.fetch_add(n, Ordering::Relaxed);
                log::info!("Checkpointed {doc_id} at v{version} ({n} journal entries compacted)");
            }
            Err(e) => log::warn!("Journal compaction for {doc_id} failed: {e}"),
        }
        Ok(())
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            journal_appends: self.stats.journal_appends.load(Ordering::Relaxed),
            journal_failures: self.stats.journal_failures.load(Ordering::Relaxed),
            checkpoints_written: self.stats.checkpoints_written.load(Ordering::Relaxed),
            checkpoint_failures: self.stats.checkpoint_failures.load(Ordering::Relaxed),
            updates_compacted: self.stats.updates_compacted.load(Ordering::Relaxed),
        }
    }
}

async fn journal_writer(
    store: Arc<dyn SnapshotStore>,
    mut rx: mpsc::UnboundedReceiver<JournalCommand>,
    policy: RetryPolicy,
    stats: Arc<AtomicBridgeStats>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            JournalCommand::Append {
                doc_id,
                version,
                delta,
            } => match append_with_retry(store.as_ref(), &policy, &doc_id, version, &delta).await {
                Ok(()) => {
                    stats.journal_appends.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    log::error!("Dropping journal entry {doc_id} v{version}: {e}");
                    stats.journal_failures.fetch_add(1, Ordering::Relaxed);
                }
            },
            JournalCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    log::debug!("Journal writer stopped");
}

async fn append_with_retry(
    store: &dyn SnapshotStore,
    policy: &RetryPolicy,
    doc_id: &str,
    version: u64,
    delta: &[u8],
) -> Result<(), StoreError> {
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match store.append_update(doc_id, version, delta) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < policy.max_attempts => {
                log::warn!("Journal append {doc_id} v{version} failed (attempt {attempt}): {e}");
                tokio::time::sleep(delay).await;
                delay = policy.next_delay(delay);
            }
            Err(e) => return Err(e),
        }
    }
}
