//! Local persistence boundary.
//!
//! The engine persists through the [`KeyValueStore`] trait: raw bytes under
//! a key inside one of a fixed set of logical stores. Typed access goes
//! through [`KeyValueStoreExt`], which serializes with bincode.
//!
//! ## Implementations
//!
//! - `memory`: `MemoryStore`, a thread-safe map for tests and ephemeral clients
//! - `rocksdb`: `RocksDbStore`, one column family per logical store

pub mod memory;
pub mod rocksdb;

pub use self::memory::MemoryStore;
pub use self::rocksdb::{RocksDbConfig, RocksDbStore};

use crate::error::{Result, SyncError};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use tracing::warn;

/// Logical store names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreName {
    /// Cell entities.
    Cells,
    /// Post entities.
    Posts,
    /// Comment entities.
    Comments,
    /// Effective votes keyed by (voter, target).
    Votes,
    /// Moderation records and the audit log.
    Moderation,
    /// Outbox entries.
    Outbox,
    /// Delegation grants keyed by wallet address.
    Delegation,
    /// Author profiles.
    Profiles,
    /// The reducer's applied-id set.
    Applied,
}

impl StoreName {
    /// All stores, in column-family order.
    pub const ALL: [StoreName; 9] = [
        StoreName::Cells,
        StoreName::Posts,
        StoreName::Comments,
        StoreName::Votes,
        StoreName::Moderation,
        StoreName::Outbox,
        StoreName::Delegation,
        StoreName::Profiles,
        StoreName::Applied,
    ];

    /// Returns the store name as used for column families.
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreName::Cells => "cells",
            StoreName::Posts => "posts",
            StoreName::Comments => "comments",
            StoreName::Votes => "votes",
            StoreName::Moderation => "moderation",
            StoreName::Outbox => "outbox",
            StoreName::Delegation => "delegation",
            StoreName::Profiles => "profiles",
            StoreName::Applied => "applied",
        }
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One write inside an atomic batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert or replace a value.
    Put {
        /// Target store.
        store: StoreName,
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Remove a key.
    Delete {
        /// Target store.
        store: StoreName,
        /// Key bytes.
        key: Vec<u8>,
    },
    /// Remove every key of a store.
    Clear {
        /// Target store.
        store: StoreName,
    },
}

/// Raw key-value persistence over named stores.
pub trait KeyValueStore: Send + Sync {
    /// Stores raw bytes at the given key.
    fn put_raw(&self, store: StoreName, key: &[u8], value: &[u8]) -> Result<()>;

    /// Loads raw bytes from the given key.
    fn get_raw(&self, store: StoreName, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Deletes a key. Deleting a missing key is not an error.
    fn delete(&self, store: StoreName, key: &[u8]) -> Result<()>;

    /// Returns every entry of a store in key order.
    fn scan(&self, store: StoreName) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Applies a batch of writes atomically.
    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()>;
}

/// Typed access over any [`KeyValueStore`].
pub trait KeyValueStoreExt: KeyValueStore {
    /// Stores a serializable value at the given key.
    fn put<T: Serialize>(&self, store: StoreName, key: &[u8], value: &T) -> Result<()> {
        self.put_raw(store, key, &encode_value(value)?)
    }

    /// Loads and deserializes a value from the given key.
    fn get<T: DeserializeOwned>(&self, store: StoreName, key: &[u8]) -> Result<Option<T>> {
        match self.get_raw(store, key)? {
            Some(bytes) => decode_value(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Collects every value of a store, skipping entries that fail to decode.
    fn scan_values<T: DeserializeOwned>(&self, store: StoreName) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for (key, bytes) in self.scan(store)? {
            match decode_value(&bytes) {
                Ok(value) => values.push(value),
                Err(e) => warn!(store = %store, key_len = key.len(), "Skipping corrupt record: {}", e),
            }
        }
        Ok(values)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

/// Serializes a value for storage.
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| SyncError::serialization(format!("Failed to serialize: {}", e)))
}

/// Deserializes a stored value.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| SyncError::serialization(format!("Failed to deserialize: {}", e)))
}

/// Creates a composite key from two byte slices.
///
/// Format: `{part1}:{part2}` (using colon separator)
pub fn composite_key(part1: &[u8], part2: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(part1.len() + 1 + part2.len());
    key.extend_from_slice(part1);
    key.push(b':');
    key.extend_from_slice(part2);
    key
}
