//! RocksDB-backed [`SnapshotStore`].
//!
//! Column families:
//! - `snapshots`: key `doc_id`, value `version (8 bytes BE) ‖ LZ4(state)`
//! - `updates`  : key `doc_id ‖ 0x00 ‖ version (8 bytes BE)`, value `LZ4(delta)`
//!
//! The NUL separator keeps one document's journal a contiguous key range
//! that no other document id can prefix, so `doc_id` must not contain NUL.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, Direction, IteratorMode,
    Options, WriteBatch, WriteOptions, DB,
};
use std::path::{Path, PathBuf};

use super::{SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";
const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_UPDATES];

const KEY_SEPARATOR: u8 = 0x00;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("flowsync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

pub struct RocksSnapshotStore {
    db: DB,
    config: StoreConfig,
}

impl RocksSnapshotStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened snapshot store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values arrive LZ4 framed
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                // Many small appends, range-scanned per document
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force a memtable flush.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn validate(doc_id: &str) -> Result<(), StoreError> {
        if doc_id.is_empty() || doc_id.as_bytes().contains(&KEY_SEPARATOR) {
            return Err(StoreError::InvalidKey(doc_id.to_string()));
        }
        Ok(())
    }

    /// `doc_id ‖ 0x00`
    fn update_prefix(doc_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(doc_id.len() + 9);
        key.extend_from_slice(doc_id.as_bytes());
        key.push(KEY_SEPARATOR);
        key
    }

    fn update_key(doc_id: &str, version: u64) -> Vec<u8> {
        let mut key = Self::update_prefix(doc_id);
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    fn version_of(prefix_len: usize, key: &[u8]) -> Option<u64> {
        let bytes: [u8; 8] = key.get(prefix_len..prefix_len + 8)?.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Visit the journal keys of `doc_id` from `from_version` on.
    fn scan_updates(
        &self,
        doc_id: &str,
        from_version: u64,
        mut visit: impl FnMut(u64, &[u8], &[u8]) -> Result<bool, StoreError>,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = Self::update_prefix(doc_id);
        let start = Self::update_key(doc_id, from_version);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let version = Self::version_of(prefix.len(), &key).ok_or_else(|| StoreError::Corrupt {
                doc_id: doc_id.to_string(),
                reason: "journal key without version".into(),
            })?;
            if !visit(version, &key, &value)? {
                break;
            }
        }
        Ok(())
    }
}

impl SnapshotStore for RocksSnapshotStore {
    fn put_snapshot(&self, doc_id: &str, blob: &[u8], version: u64) -> Result<(), StoreError> {
        Self::validate(doc_id)?;
        let cf = self.cf(CF_SNAPSHOTS)?;
        let compressed = lz4_flex::compress_prepend_size(blob);
        let mut value = Vec::with_capacity(8 + compressed.len());
        value.extend_from_slice(&version.to_be_bytes());
        value.extend_from_slice(&compressed);
        self.db
            .put_cf_opt(cf, doc_id.as_bytes(), &value, &self.write_options())?;
        log::debug!(
            "Stored snapshot of {doc_id} v{version}: {} -> {} bytes",
            blob.len(),
            compressed.len()
        );
        Ok(())
    }

    fn get_snapshot(&self, doc_id: &str) -> Result<Option<(Vec<u8>, u64)>, StoreError> {
        Self::validate(doc_id)?;
        let cf = self.cf(CF_SNAPSHOTS)?;
        let Some(value) = self.db.get_cf(cf, doc_id.as_bytes())? else {
            return Ok(None);
        };
        let version = Self::version_of(0, &value).ok_or_else(|| StoreError::Corrupt {
            doc_id: doc_id.to_string(),
            reason: "snapshot shorter than its version header".into(),
        })?;
        let blob = lz4_flex::decompress_size_prepended(&value[8..])
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        Ok(Some((blob, version)))
    }

    fn append_update(&self, doc_id: &str, version: u64, delta: &[u8]) -> Result<(), StoreError> {
        Self::validate(doc_id)?;
        let cf = self.cf(CF_UPDATES)?;
        let compressed = lz4_flex::compress_prepend_size(delta);
        self.db.put_cf_opt(
            cf,
            Self::update_key(doc_id, version),
            &compressed,
            &self.write_options(),
        )?;
        Ok(())
    }

    fn updates_since(&self, doc_id: &str, from_version: u64) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        Self::validate(doc_id)?;
        let mut updates = Vec::new();
        self.scan_updates(doc_id, from_version, |version, _, value| {
            let delta = lz4_flex::decompress_size_prepended(value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            updates.push((version, delta));
            Ok(true)
        })?;
        Ok(updates)
    }

    fn compact_updates(&self, doc_id: &str, up_to: u64) -> Result<u64, StoreError> {
        Self::validate(doc_id)?;
        let cf = self.cf(CF_UPDATES)?;
        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        self.scan_updates(doc_id, 0, |version, key, _| {
            if version > up_to {
                return Ok(false);
            }
            batch.delete_cf(cf, key);
            count += 1;
            Ok(true)
        })?;
        if count > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(count)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> RocksSnapshotStore {
        RocksSnapshotStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert!(store.path().exists());
    }

    #[test]
    fn test_snapshot_roundtrip_with_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let data = b"workflow state with enough repetition repetition repetition".to_vec();

        assert!(store.get_snapshot("wf_1").unwrap().is_none());
        store.put_snapshot("wf_1", &data, 12).unwrap();
        assert_eq!(store.get_snapshot("wf_1").unwrap(), Some((data, 12)));

        store.put_snapshot("wf_1", b"newer", 20).unwrap();
        assert_eq!(store.get_snapshot("wf_1").unwrap().unwrap().1, 20);
    }

    #[test]
    fn test_journal_range_and_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        for v in 1..=20u64 {
            store.append_update("wf", v, format!("delta_{v}").as_bytes()).unwrap();
        }

        let since = store.updates_since("wf", 15).unwrap();
        assert_eq!(since.len(), 6);
        assert_eq!(since[0], (15, b"delta_15".to_vec()));

        assert_eq!(store.compact_updates("wf", 10).unwrap(), 10);
        let remaining = store.updates_since("wf", 0).unwrap();
        assert_eq!(remaining.len(), 10);
        assert_eq!(remaining[0].0, 11);
    }

    #[test]
    fn test_prefix_ids_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        store.append_update("wf", 1, b"a").unwrap();
        store.append_update("wf2", 1, b"b").unwrap();
        store.append_update("w", 1, b"c").unwrap();

        assert_eq!(store.updates_since("wf", 0).unwrap(), vec![(1, b"a".to_vec())]);
        assert_eq!(store.compact_updates("wf", u64::MAX).unwrap(), 1);
        assert_eq!(store.updates_since("wf2", 0).unwrap().len(), 1);
        assert_eq!(store.updates_since("w", 0).unwrap().len(), 1);
    }

    #[test]
    fn test_versions_sort_numerically() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        for v in [256u64, 1, 65_536, 2] {
            store.append_update("wf", v, &[0]).unwrap();
        }
        let versions: Vec<u64> = store.updates_since("wf", 0).unwrap().into_iter().map(|(v, _)| v).collect();
        assert_eq!(versions, vec![1, 2, 256, 65_536]);
    }

    #[test]
    fn test_rejects_nul_in_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert!(matches!(
            store.append_update("bad\0id", 1, b"x"),
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir);
            store.put_snapshot("wf", b"state", 3).unwrap();
            store.append_update("wf", 4, b"d4").unwrap();
            store.flush().unwrap();
        }
        let store = open(&dir);
        assert_eq!(store.get_snapshot("wf").unwrap(), Some((b"state".to_vec(), 3)));
        assert_eq!(store.updates_since("wf", 4).unwrap(), vec![(4, b"d4".to_vec())]);
        assert!(store.contains("wf").unwrap());
        assert!(!store.contains("other").unwrap());
    }
}
