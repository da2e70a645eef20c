//! RocksDB-backed key-value store.
//!
//! Each logical [`StoreName`] maps to one column family. Batches go through
//! a RocksDB `WriteBatch`, so a reducer checkpoint is applied atomically.

use crate::error::{Result, SyncError};
use crate::storage::{KeyValueStore, StoreName, WriteOp};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};

// =============================================================================
// RocksDB Configuration
// =============================================================================

/// Configuration for RocksDB storage.
#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    /// Maximum number of open files.
    pub max_open_files: i32,
    /// Number of log files to keep.
    pub keep_log_file_num: usize,
    /// Maximum WAL size in bytes.
    pub max_wal_size: u64,
    /// Write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Maximum number of write buffers.
    pub max_write_buffer_number: i32,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            max_open_files: 64,
            keep_log_file_num: 2,
            max_wal_size: 16 * 1024 * 1024,      // 16MB
            write_buffer_size: 8 * 1024 * 1024,  // 8MB
            max_write_buffer_number: 2,
        }
    }
}

impl RocksDbConfig {
    /// Creates a configuration for long-running nodes with large caches.
    pub fn for_server() -> Self {
        Self {
            max_open_files: 256,
            keep_log_file_num: 3,
            max_wal_size: 64 * 1024 * 1024,      // 64MB
            write_buffer_size: 64 * 1024 * 1024, // 64MB
            max_write_buffer_number: 3,
        }
    }

    /// Builds RocksDB Options from this configuration.
    pub fn build_options(&self) -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(self.max_open_files);
        opts.set_keep_log_file_num(self.keep_log_file_num);
        opts.set_max_total_wal_size(self.max_wal_size);
        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_write_buffer_size(self.write_buffer_size);
        opts.set_max_write_buffer_number(self.max_write_buffer_number);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }
}

// =============================================================================
// Store
// =============================================================================

/// A [`KeyValueStore`] persisted in RocksDB.
pub struct RocksDbStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RocksDbStore {
    /// Opens (or creates) the database with one column family per store.
    pub fn open(db_path: impl AsRef<Path>, config: &RocksDbConfig) -> Result<Self> {
        let opts = config.build_options();
        let cf_opts = Options::default();

        let cf_descriptors: Vec<_> = StoreName::ALL
            .iter()
            .map(|store| ColumnFamilyDescriptor::new(store.as_str(), cf_opts.clone()))
            .collect();

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(
            &opts,
            db_path.as_ref(),
            cf_descriptors,
        )
        .map_err(|e| SyncError::storage(format!("Failed to open RocksDB: {}", e)))?;

        debug!(path = %db_path.as_ref().display(), "Opened RocksDB store");
        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, store: StoreName) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(store.as_str())
            .ok_or_else(|| SyncError::storage(format!("Column family '{}' not found", store)))
    }

    fn keys(&self, store: StoreName) -> Result<Vec<Vec<u8>>> {
        Ok(self.scan(store)?.into_iter().map(|(k, _)| k).collect())
    }
}

impl KeyValueStore for RocksDbStore {
    fn put_raw(&self, store: StoreName, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.cf(store)?;

        trace!(
            cf = store.as_str(),
            key_len = key.len(),
            value_bytes = value.len(),
            "Put record"
        );

        self.db
            .put_cf(&cf, key, value)
            .map_err(|e| SyncError::storage(format!("Failed to write: {}", e)))
    }

    fn get_raw(&self, store: StoreName, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(store)?;

        match self.db.get_cf(&cf, key) {
            Ok(Some(bytes)) => {
                trace!(
                    cf = store.as_str(),
                    key_len = key.len(),
                    value_bytes = bytes.len(),
                    "Read record"
                );
                Ok(Some(bytes))
            }
            Ok(None) => {
                trace!(cf = store.as_str(), key_len = key.len(), "Record not found");
                Ok(None)
            }
            Err(e) => Err(SyncError::storage(format!("Failed to read: {}", e))),
        }
    }

    fn delete(&self, store: StoreName, key: &[u8]) -> Result<()> {
        let cf = self.cf(store)?;

        trace!(cf = store.as_str(), key_len = key.len(), "Delete record");

        self.db
            .delete_cf(&cf, key)
            .map_err(|e| SyncError::storage(format!("Failed to delete: {}", e)))
    }

    fn scan(&self, store: StoreName) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(store)?;
        let mut entries = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            match item {
                Ok((key, value)) => entries.push((key.to_vec(), value.to_vec())),
                Err(e) => warn!(cf = store.as_str(), "Skipping unreadable record: {}", e),
            }
        }

        debug!(
            cf = store.as_str(),
            records = entries.len(),
            "Scanned store"
        );

        Ok(entries)
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut batch = WriteBatch::default();
        let op_count = ops.len();

        for op in ops {
            match op {
                WriteOp::Put { store, key, value } => {
                    let cf = self.cf(store)?;
                    batch.put_cf(&cf, key, value);
                }
                WriteOp::Delete { store, key } => {
                    let cf = self.cf(store)?;
                    batch.delete_cf(&cf, key);
                }
                WriteOp::Clear { store } => {
                    let keys = self.keys(store)?;
                    let cf = self.cf(store)?;
                    for key in keys {
                        batch.delete_cf(&cf, key);
                    }
                }
            }
        }

        debug!(ops = op_count, batch_len = batch.len(), "Committing write batch");

        self.db
            .write(batch)
            .map_err(|e| SyncError::storage(format!("Failed to write batch: {}", e)))
    }
}

impl std::fmt::Debug for RocksDbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbStore")
            .field("db", &"RocksDB")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KeyValueStoreExt;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestData {
        name: String,
        value: u64,
    }

    fn create_test_db() -> (RocksDbStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test_db");
        let db = RocksDbStore::open(&db_path, &RocksDbConfig::default()).expect("Failed to open db");
        (db, temp_dir)
    }

    #[test]
    fn test_put_and_get() {
        let (db, _temp) = create_test_db();

        let data = TestData {
            name: "Test".to_string(),
            value: 12345,
        };

        db.put(StoreName::Cells, b"key1", &data).unwrap();

        let loaded: TestData = db.get(StoreName::Cells, b"key1").unwrap().unwrap();
        assert_eq!(loaded, data);
    }

    #[test]
    fn test_stores_are_isolated() {
        let (db, _temp) = create_test_db();

        db.put_raw(StoreName::Posts, b"key", b"post").unwrap();
        assert!(db.get_raw(StoreName::Comments, b"key").unwrap().is_none());

        db.delete(StoreName::Posts, b"key").unwrap();
        assert!(db.get_raw(StoreName::Posts, b"key").unwrap().is_none());
    }

    #[test]
    fn test_batch_clear_and_reopen() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("db");
        {
            let db = RocksDbStore::open(&db_path, &RocksDbConfig::default()).unwrap();
            db.put_raw(StoreName::Votes, b"stale", b"0").unwrap();
            db.write_batch(vec![
                WriteOp::Clear {
                    store: StoreName::Votes,
                },
                WriteOp::Put {
                    store: StoreName::Votes,
                    key: b"fresh".to_vec(),
                    value: b"1".to_vec(),
                },
            ])
            .unwrap();
        }

        let db = RocksDbStore::open(&db_path, &RocksDbConfig::default()).unwrap();
        let entries = db.scan(StoreName::Votes).unwrap();
        assert_eq!(entries, vec![(b"fresh".to_vec(), b"1".to_vec())]);
    }

    #[test]
    fn test_server_config() {
        let config = RocksDbConfig::for_server();
        assert_eq!(config.max_open_files, 256);
        assert_eq!(config.max_wal_size, 64 * 1024 * 1024);
    }
}
