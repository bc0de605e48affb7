//! Registry of resident workflow documents.
//!
//! ```text
//! workflow id ──► Arc<DocumentHandle>
//!                   ├── Mutex<WorkflowDocument>   (merge work, never held across .await)
//!                   ├── BroadcastGroup            (room fan-out)
//!                   ├── Mutex<PresenceRoom>       (ephemeral)
//!                   └── version / checkpointed    (journal + checkpoint bookkeeping)
//! ```
//!
//! Documents are created on first use (hydrated from the store when it has
//! state, seeded with the main graph otherwise) and evicted once idle with
//! no connections, but only right after a checkpoint covering their last
//! version.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use flowsync_core::{LocalChange, Mutation, WorkflowDocument, WorkflowSnapshot};
use tokio::sync::RwLock;

use crate::broadcast::BroadcastGroup;
use crate::error::CollabError;
use crate::presence::PresenceRoom;
use crate::storage::PersistenceBridge;

/// Actor id of the server replica.
pub const SERVER_ACTOR: &str = "server";

/// A delta the document accepted, with its journal version.
#[derive(Debug, Clone)]
pub struct Applied {
    pub delta: Vec<u8>,
    pub state_summary: Vec<u8>,
    pub version: u64,
}

/// Outcome of one [`DocumentRegistry::checkpoint_all`] pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointReport {
    pub written: usize,
    pub unchanged: usize,
    pub failed: Vec<String>,
}

/// One resident workflow.
pub struct DocumentHandle {
    id: String,
    document: Mutex<WorkflowDocument>,
    room: BroadcastGroup,
    presence: Mutex<PresenceRoom>,
    /// Version of the last accepted delta
    version: AtomicU64,
    /// Version covered by the last successful checkpoint
    checkpointed: AtomicU64,
    evicted: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl DocumentHandle {
    fn new(id: &str, document: WorkflowDocument, version: u64, checkpointed: u64, capacity: usize) -> Self {
        Self {
            id: id.to_string(),
            document: Mutex::new(document),
            room: BroadcastGroup::new(capacity),
            presence: Mutex::new(PresenceRoom::new()),
            version: AtomicU64::new(version),
            checkpointed: AtomicU64::new(checkpointed),
            evicted: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn room(&self) -> &BroadcastGroup {
        &self.room
    }

    /// Lock the presence records. Synchronous; do not hold across `.await`.
    pub fn presence(&self) -> MutexGuard<'_, PresenceRoom> {
        self.presence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn document(&self) -> MutexGuard<'_, WorkflowDocument> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn checkpointed_version(&self) -> u64 {
        self.checkpointed.load(Ordering::SeqCst)
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Apply a mutation as the server replica.
    pub fn apply_local(&self, mutation: &Mutation) -> Result<Applied, CollabError> {
        let mut document = self.document();
        if self.is_evicted() {
            return Err(CollabError::Evicted(self.id.clone()));
        }
        let LocalChange {
            delta,
            state_summary,
        } = document.apply_local(mutation)?;
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        drop(document);
        self.touch();
        Ok(Applied {
            delta,
            state_summary,
            version,
        })
    }

    /// Merge a delta from another replica; returns its journal version.
    pub fn apply_remote(&self, delta: &[u8]) -> Result<u64, CollabError> {
        let mut document = self.document();
        if self.is_evicted() {
            return Err(CollabError::Evicted(self.id.clone()));
        }
        document.apply_remote(delta)?;
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        drop(document);
        self.touch();
        Ok(version)
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        self.document().snapshot()
    }

    pub fn state_summary(&self) -> Vec<u8> {
        self.document().state_summary()
    }

    /// Delta bringing a replica with `summary` up to date. An empty summary
    /// means "nothing yet" and yields the full state.
    pub fn catch_up(&self, summary: &[u8]) -> Result<Vec<u8>, CollabError> {
        let document = self.document();
        if summary.is_empty() {
            return Ok(document.encode_state());
        }
        Ok(document.diff_since(summary)?)
    }

    pub fn encode_state(&self) -> Vec<u8> {
        self.document().encode_state()
    }

    /// Read through the document without cloning a full snapshot.
    pub fn with_document<R>(&self, read: impl FnOnce(&WorkflowDocument) -> R) -> R {
        read(&self.document())
    }

    /// Full state and the version it covers, read atomically.
    fn versioned_state(&self) -> (Vec<u8>, u64) {
        let document = self.document();
        (document.encode_state(), self.version())
    }
}

/// Maps workflow ids to resident documents.
pub struct DocumentRegistry {
    documents: RwLock<HashMap<String, Arc<DocumentHandle>>>,
    bridge: PersistenceBridge,
    broadcast_capacity: usize,
}

impl DocumentRegistry {
    pub fn new(bridge: PersistenceBridge, broadcast_capacity: usize) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            bridge,
            broadcast_capacity,
        }
    }

    pub fn bridge(&self) -> &PersistenceBridge {
        &self.bridge
    }

    /// Resident handle, if loaded.
    pub async fn get(&self, workflow_id: &str) -> Option<Arc<DocumentHandle>> {
        self.documents.read().await.get(workflow_id).cloned()
    }

    /// Resident or stored.
    pub async fn exists(&self, workflow_id: &str) -> Result<bool, CollabError> {
        if self.get(workflow_id).await.is_some() {
            return Ok(true);
        }
        self.bridge.contains(workflow_id)
    }

    /// Obtain the document, creating it when neither resident nor stored.
    pub async fn open(&self, workflow_id: &str) -> Result<Arc<DocumentHandle>, CollabError> {
        if let Some(handle) = self.get(workflow_id).await {
            return Ok(handle);
        }
        self.load(workflow_id, false).await
    }

    /// Resolve `workflow_id` under the registry write lock. With
    /// `must_be_new`, a resident or stored document is an error instead.
    async fn load(&self, workflow_id: &str, must_be_new: bool) -> Result<Arc<DocumentHandle>, CollabError> {
        let mut documents = self.documents.write().await;
        if let Some(handle) = documents.get(workflow_id) {
            if must_be_new {
                return Err(CollabError::WorkflowExists(workflow_id.to_string()));
            }
            return Ok(handle.clone());
        }
        if must_be_new && self.bridge.contains(workflow_id)? {
            return Err(CollabError::WorkflowExists(workflow_id.to_string()));
        }
        // Hydration runs under the write lock so concurrent opens of a new
        // id seed the main graph exactly once.
        let handle = match self.bridge.hydrate(workflow_id, SERVER_ACTOR)? {
            Some(hydrated) => DocumentHandle::new(
                workflow_id,
                hydrated.document,
                hydrated.version,
                hydrated.checkpoint_version,
                self.broadcast_capacity,
            ),
            None => {
                let mut document = WorkflowDocument::new(SERVER_ACTOR);
                let seed = document.seed_main_graph()?;
                self.bridge.journal(workflow_id, 1, seed.delta);
                log::info!("Created workflow {workflow_id}");
                DocumentHandle::new(workflow_id, document, 1, 0, self.broadcast_capacity)
            }
        };
        let handle = Arc::new(handle);
        documents.insert(workflow_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Obtain the document only if it is resident or stored.
    pub async fn open_existing(&self, workflow_id: &str) -> Result<Arc<DocumentHandle>, CollabError> {
        if !self.exists(workflow_id).await? {
            return Err(CollabError::WorkflowNotFound(workflow_id.to_string()));
        }
        self.open(workflow_id).await
    }

    /// Create a workflow that must not exist yet. Of several concurrent
    /// calls for one id, exactly one succeeds.
    pub async fn create(&self, workflow_id: &str) -> Result<Arc<DocumentHandle>, CollabError> {
        self.load(workflow_id, true).await
    }

    /// Apply a server-side mutation and journal it.
    pub async fn apply_local_change(
        &self,
        workflow_id: &str,
        mutation: &Mutation,
    ) -> Result<(Arc<DocumentHandle>, Applied), CollabError> {
        loop {
            let handle = self.open_existing(workflow_id).await?;
            match handle.apply_local(mutation) {
                Err(CollabError::Evicted(_)) => continue,
                Err(e) => return Err(e),
                Ok(applied) => {
                    self.bridge
                        .journal(workflow_id, applied.version, applied.delta.clone());
                    return Ok((handle, applied));
                }
            }
        }
    }

    /// Merge a delta from a client replica and journal it.
    pub async fn apply_remote_delta(&self, workflow_id: &str, delta: &[u8]) -> Result<u64, CollabError> {
        loop {
            let handle = self.open_existing(workflow_id).await?;
            match handle.apply_remote(delta) {
                Err(CollabError::Evicted(_)) => continue,
                Err(e) => return Err(e),
                Ok(version) => {
                    self.bridge.journal(workflow_id, version, delta.to_vec());
                    return Ok(version);
                }
            }
        }
    }

    /// Journal a delta accepted through a handle the caller already holds.
    pub fn journal(&self, workflow_id: &str, version: u64, delta: Vec<u8>) {
        self.bridge.journal(workflow_id, version, delta);
    }

    pub async fn get_snapshot(&self, workflow_id: &str) -> Result<WorkflowSnapshot, CollabError> {
        Ok(self.open_existing(workflow_id).await?.snapshot())
    }

    pub async fn get_state_summary(&self, workflow_id: &str) -> Result<Vec<u8>, CollabError> {
        Ok(self.open_existing(workflow_id).await?.state_summary())
    }

    pub async fn catch_up(&self, workflow_id: &str, summary: &[u8]) -> Result<Vec<u8>, CollabError> {
        self.open_existing(workflow_id).await?.catch_up(summary)
    }

    /// Checkpoint one resident document. `Ok(false)` when its version is
    /// already covered.
    pub async fn checkpoint(&self, workflow_id: &str) -> Result<bool, CollabError> {
        let Some(handle) = self.get(workflow_id).await else {
            return Ok(false);
        };
        self.checkpoint_handle(&handle).await
    }

    async fn checkpoint_handle(&self, handle: &DocumentHandle) -> Result<bool, CollabError> {
        let (state, version) = handle.versioned_state();
        if version == handle.checkpointed_version() {
            return Ok(false);
        }
        self.bridge.checkpoint(handle.id(), &state, version).await?;
        handle.checkpointed.fetch_max(version, Ordering::SeqCst);
        Ok(true)
    }

    /// Checkpoint every resident document whose version moved.
    pub async fn checkpoint_all(&self) -> CheckpointReport {
        let handles: Vec<Arc<DocumentHandle>> = self.documents.read().await.values().cloned().collect();
        let mut report = CheckpointReport::default();
        for handle in handles {
            match self.checkpoint_handle(&handle).await {
                Ok(true) => report.written += 1,
                Ok(false) => report.unchanged += 1,
                Err(e) => {
                    log::error!("Checkpoint of {} failed: {e}", handle.id());
                    report.failed.push(handle.id().to_string());
                }
            }
        }
        report
    }

    /// Evict documents without connections that have been idle for at
    /// least `grace`. A document is only evicted after a checkpoint covering
    /// its current version succeeded.
    pub async fn evict_idle(&self, grace: Duration) -> Vec<String> {
        let candidates: Vec<Arc<DocumentHandle>> = {
            let documents = self.documents.read().await;
            documents
                .values()
                .filter(|h| h.idle_for() >= grace)
                .cloned()
                .collect()
        };

        let mut evicted = Vec::new();
        for handle in candidates {
            if handle.room().peer_count().await > 0 {
                continue;
            }
            if let Err(e) = self.checkpoint_handle(&handle).await {
                log::warn!("Keeping {} resident, flush failed: {e}", handle.id());
                continue;
            }

            let mut documents = self.documents.write().await;
            // Closing under the peer lock makes a racing join either land
            // before this check or fail with `Closed` and reopen.
            if !handle.room().close_if_empty().await {
                continue;
            }
            let covered = {
                let _document = handle.document();
                // A delta accepted after the flush keeps the document resident
                let covered = handle.version() == handle.checkpointed_version();
                if covered {
                    handle.evicted.store(true, Ordering::SeqCst);
                }
                covered
            };
            if !covered {
                handle.room().reopen().await;
                continue;
            }
            documents.remove(handle.id());
            log::info!("Evicted idle workflow {}", handle.id());
            evicted.push(handle.id().to_string());
        }
        evicted
    }

    pub async fn resident_count(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn resident_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.documents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of every resident handle.
    pub async fn handles(&self) -> Vec<Arc<DocumentHandle>> {
        self.documents.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::AdmitError;
    use crate::protocol::PeerInfo;
    use crate::storage::{MemorySnapshotStore, RetryPolicy, SnapshotStore};
    use flowsync_core::{Node, NodeMetadata, Position, MAIN_GRAPH_ID};
    use uuid::Uuid;

    fn registry() -> (Arc<MemorySnapshotStore>, DocumentRegistry) {
        let store = Arc::new(MemorySnapshotStore::new());
        let bridge = PersistenceBridge::new(store.clone(), RetryPolicy::for_testing());
        (store, DocumentRegistry::new(bridge, 16))
    }

    fn add_node(id: &str) -> Mutation {
        Mutation::AddNode {
            graph_id: MAIN_GRAPH_ID.into(),
            node: Node {
                id: id.into(),
                position: Position::new(1.0, 2.0),
                metadata: NodeMetadata {
                    node_type: "http".into(),
                    title: id.into(),
                    ..Default::default()
                },
                group_id: None,
            },
        }
    }

    #[tokio::test]
    async fn test_open_creates_seeded_document_once() {
        let (_, registry) = registry();
        let a = registry.open("wf").await.unwrap();
        let b = registry.open("wf").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.snapshot().main_graph().is_some());
        assert_eq!(a.version(), 1);
        assert_eq!(registry.resident_count().await, 1);
    }

    #[tokio::test]
    async fn test_open_existing_rejects_unknown() {
        let (_, registry) = registry();
        let err = registry.open_existing("ghost").await.unwrap_err();
        assert!(matches!(err, CollabError::WorkflowNotFound(id) if id == "ghost"));
        assert_eq!(registry.resident_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate() {
        let (_, registry) = registry();
        registry.create("wf").await.unwrap();
        assert!(matches!(
            registry.create("wf").await,
            Err(CollabError::WorkflowExists(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_admits_one() {
        let (_, registry) = registry();
        let registry = Arc::new(registry);
        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.create("wf").await.map(|_| ()) })
            })
            .collect();

        let mut created = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(()) => created += 1,
                Err(e) => assert!(matches!(e, CollabError::WorkflowExists(_)), "{e}"),
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_create_rejects_stored_workflow() {
        let (_, registry) = registry();
        registry.create("wf").await.unwrap();
        registry.evict_idle(Duration::ZERO).await;
        assert_eq!(registry.resident_count().await, 0);
        assert!(matches!(
            registry.create("wf").await,
            Err(CollabError::WorkflowExists(_))
        ));
    }

    #[tokio::test]
    async fn test_local_change_bumps_version_and_journals() {
        let (store, registry) = registry();
        registry.open("wf").await.unwrap();
        let (_, applied) = registry.apply_local_change("wf", &add_node("a")).await.unwrap();
        assert_eq!(applied.version, 2);

        registry.bridge().flush_journal().await;
        let versions: Vec<u64> = store.updates_since("wf", 0).unwrap().into_iter().map(|(v, _)| v).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_validation_error_keeps_version() {
        let (_, registry) = registry();
        let handle = registry.open("wf").await.unwrap();
        let err = registry
            .apply_local_change(
                "wf",
                &Mutation::RemoveNode {
                    graph_id: MAIN_GRAPH_ID.into(),
                    node_id: "nope".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::Document(_)));
        assert_eq!(handle.version(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_remote_delta_is_rejected() {
        let (_, registry) = registry();
        let handle = registry.open("wf").await.unwrap();
        let before = handle.snapshot();
        assert!(registry.apply_remote_delta("wf", &[0xde, 0xad]).await.is_err());
        assert_eq!(handle.snapshot(), before);
        assert_eq!(handle.version(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_is_idempotent() {
        let (store, registry) = registry();
        registry.open("wf").await.unwrap();
        assert!(registry.checkpoint("wf").await.unwrap());
        assert!(!registry.checkpoint("wf").await.unwrap());
        assert_eq!(store.put_count(), 1);

        registry.apply_local_change("wf", &add_node("a")).await.unwrap();
        let report = registry.checkpoint_all().await;
        assert_eq!(report.written, 1);
        assert_eq!(store.snapshot_version("wf"), Some(2));
    }

    #[tokio::test]
    async fn test_evict_and_rehydrate() {
        let (_, registry) = registry();
        registry.open("wf").await.unwrap();
        registry.apply_local_change("wf", &add_node("a")).await.unwrap();

        let evicted = registry.evict_idle(Duration::ZERO).await;
        assert_eq!(evicted, vec!["wf".to_string()]);
        assert_eq!(registry.resident_count().await, 0);

        assert!(registry.exists("wf").await.unwrap());
        let snapshot = registry.get_snapshot("wf").await.unwrap();
        assert!(snapshot.node(MAIN_GRAPH_ID, "a").is_some());
        assert_eq!(registry.get("wf").await.unwrap().version(), 2);
    }

    #[tokio::test]
    async fn test_failed_flush_blocks_eviction() {
        let (store, registry) = registry();
        registry.open("wf").await.unwrap();
        store.fail_next_puts(100);
        assert!(registry.evict_idle(Duration::ZERO).await.is_empty());
        assert_eq!(registry.resident_count().await, 1);
    }

    #[tokio::test]
    async fn test_evicted_handle_refuses_writes() {
        let (_, registry) = registry();
        let stale = registry.open("wf").await.unwrap();
        registry.evict_idle(Duration::ZERO).await;
        assert!(matches!(
            stale.apply_local(&add_node("x")),
            Err(CollabError::Evicted(_))
        ));
        // The registry path transparently reopens
        registry.apply_local_change("wf", &add_node("x")).await.unwrap();
    }

    #[tokio::test]
    async fn test_eviction_closes_the_room() {
        let (_, registry) = registry();
        let stale = registry.open("wf").await.unwrap();
        registry.evict_idle(Duration::ZERO).await;
        assert!(stale.room().is_closed());
        let peer = PeerInfo::new("u1", "A");
        assert_eq!(
            stale.room().try_add_peer(Uuid::new_v4(), peer.clone(), 10).await.err(),
            Some(AdmitError::Closed)
        );

        let fresh = registry.open("wf").await.unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert!(fresh.room().try_add_peer(Uuid::new_v4(), peer, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_occupied_room_is_not_evicted() {
        let (_, registry) = registry();
        let handle = registry.open("wf").await.unwrap();
        let _rx = handle
            .room()
            .try_add_peer(Uuid::new_v4(), PeerInfo::new("u1", "A"), 10)
            .await
            .unwrap();
        assert!(registry.evict_idle(Duration::ZERO).await.is_empty());
        assert!(!handle.room().is_closed());
        assert!(!handle.is_evicted());
    }
}
