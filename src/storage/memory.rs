//! In-memory key-value store.

use crate::error::{Result, SyncError};
use crate::storage::{KeyValueStore, StoreName, WriteOp};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tracing::trace;

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// A [`KeyValueStore`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<StoreName, Table>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a store.
    pub fn len(&self, store: StoreName) -> usize {
        self.tables
            .read()
            .map(|tables| tables.get(&store).map_or(0, |t| t.len()))
            .unwrap_or(0)
    }

    /// Returns true if the store has no entries.
    pub fn is_empty(&self, store: StoreName) -> bool {
        self.len(store) == 0
    }
}

fn poisoned() -> SyncError {
    SyncError::storage("Memory store lock poisoned")
}

impl KeyValueStore for MemoryStore {
    fn put_raw(&self, store: StoreName, key: &[u8], value: &[u8]) -> Result<()> {
        trace!(store = %store, key_len = key.len(), value_bytes = value.len(), "mem_put");
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        tables
            .entry(store)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get_raw(&self, store: StoreName, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables.get(&store).and_then(|t| t.get(key)).cloned())
    }

    fn delete(&self, store: StoreName, key: &[u8]) -> Result<()> {
        trace!(store = %store, key_len = key.len(), "mem_delete");
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        if let Some(table) = tables.get_mut(&store) {
            table.remove(key);
        }
        Ok(())
    }

    fn scan(&self, store: StoreName) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables
            .get(&store)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        for op in ops {
            match op {
                WriteOp::Put { store, key, value } => {
                    tables.entry(store).or_default().insert(key, value);
                }
                WriteOp::Delete { store, key } => {
                    if let Some(table) = tables.get_mut(&store) {
                        table.remove(&key);
                    }
                }
                WriteOp::Clear { store } => {
                    tables.remove(&store);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KeyValueStoreExt;

    #[test]
    fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put(StoreName::Cells, b"a", &42u64).unwrap();
        assert_eq!(store.get::<u64>(StoreName::Cells, b"a").unwrap(), Some(42));
        assert_eq!(store.get::<u64>(StoreName::Posts, b"a").unwrap(), None);

        store.delete(StoreName::Cells, b"a").unwrap();
        assert!(store.is_empty(StoreName::Cells));
    }

    #[test]
    fn test_batch_clear_then_put() {
        let store = MemoryStore::new();
        store.put_raw(StoreName::Votes, b"old", b"1").unwrap();
        store
            .write_batch(vec![
                WriteOp::Clear {
                    store: StoreName::Votes,
                },
                WriteOp::Put {
                    store: StoreName::Votes,
                    key: b"new".to_vec(),
                    value: b"2".to_vec(),
                },
            ])
            .unwrap();
        let entries = store.scan(StoreName::Votes).unwrap();
        assert_eq!(entries, vec![(b"new".to_vec(), b"2".to_vec())]);
    }
}
