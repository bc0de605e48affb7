//! In-memory [`SnapshotStore`] for tests and ephemeral servers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{SnapshotStore, StoreError};

#[derive(Default)]
struct Inner {
    snapshots: HashMap<String, (Vec<u8>, u64)>,
    updates: HashMap<String, BTreeMap<u64, Vec<u8>>>,
}

/// Process-local store. Can be told to fail writes, to exercise retry paths.
#[derive(Default)]
pub struct MemorySnapshotStore {
    inner: Mutex<Inner>,
    /// Remaining snapshot writes that will fail
    failing_puts: AtomicU32,
    /// Fail every write until cleared
    unavailable: AtomicBool,
    puts: AtomicU64,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` snapshot writes fail.
    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Fail every write while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Successful snapshot writes so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn snapshot_version(&self, doc_id: &str) -> Option<u64> {
        self.lock().ok()?.snapshots.get(doc_id).map(|(_, v)| *v)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".into()));
        }
        Ok(())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn put_snapshot(&self, doc_id: &str, blob: &[u8], version: u64) -> Result<(), StoreError> {
        self.check_available()?;
        let injected = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        self.lock()?
            .snapshots
            .insert(doc_id.to_string(), (blob.to_vec(), version));
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_snapshot(&self, doc_id: &str) -> Result<Option<(Vec<u8>, u64)>, StoreError> {
        Ok(self.lock()?.snapshots.get(doc_id).cloned())
    }

    fn append_update(&self, doc_id: &str, version: u64, delta: &[u8]) -> Result<(), StoreError> {
        self.check_available()?;
        self.lock()?
            .updates
            .entry(doc_id.to_string())
            .or_default()
            .insert(version, delta.to_vec());
        Ok(())
    }

    fn updates_since(&self, doc_id: &str, from_version: u64) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .updates
            .get(doc_id)
            .map(|log| {
                log.range(from_version..)
                    .map(|(v, d)| (*v, d.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn compact_updates(&self, doc_id: &str, up_to: u64) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut inner = self.lock()?;
        let Some(log) = inner.updates.get_mut(doc_id) else {
            return Ok(0);
        };
        let keep = log.split_off(&(up_to.saturating_add(1)));
        let removed = log.len() as u64;
        *log = keep;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_roundtrip() {
        let store = MemorySnapshotStore::new();
        assert!(store.get_snapshot("wf").unwrap().is_none());
        store.put_snapshot("wf", b"state", 7).unwrap();
        assert_eq!(store.get_snapshot("wf").unwrap(), Some((b"state".to_vec(), 7)));
        assert_eq!(store.put_count(), 1);
    }

    #[test]
    fn test_updates_since_and_compact() {
        let store = MemorySnapshotStore::new();
        for v in 1..=6 {
            store.append_update("wf", v, &[v as u8]).unwrap();
        }
        let since = store.updates_since("wf", 4).unwrap();
        assert_eq!(since.iter().map(|(v, _)| *v).collect::<Vec<_>>(), vec![4, 5, 6]);

        assert_eq!(store.compact_updates("wf", 4).unwrap(), 4);
        assert_eq!(store.updates_since("wf", 0).unwrap().len(), 2);
    }

    #[test]
    fn test_contains() {
        let store = MemorySnapshotStore::new();
        assert!(!store.contains("wf").unwrap());
        store.append_update("wf", 1, b"d").unwrap();
        assert!(store.contains("wf").unwrap());
    }

    #[test]
    fn test_injected_failures() {
        let store = MemorySnapshotStore::new();
        store.fail_next_puts(2);
        assert!(store.put_snapshot("wf", b"a", 1).is_err());
        assert!(store.put_snapshot("wf", b"a", 1).is_err());
        assert!(store.put_snapshot("wf", b"a", 1).is_ok());

        store.set_unavailable(true);
        assert!(store.append_update("wf", 2, b"d").is_err());
        store.set_unavailable(false);
        assert!(store.append_update("wf", 2, b"d").is_ok());
    }
}
