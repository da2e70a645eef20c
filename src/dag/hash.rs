//! Content-addressed hashing for messages.
//!
//! `ContentHash` is a 32-byte SHA3-256 digest computed over bincode-serialized
//! data. Its byte order is the total order used to break timestamp ties.

use crate::crypto::hash_data;
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte content hash using SHA3-256.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Computes the content hash of serializable data.
    pub fn compute<T: Serialize>(data: &T) -> Result<Self> {
        let serialized = bincode::serialize(data).map_err(|e| {
            SyncError::serialization(format!("Failed to serialize for hash: {}", e))
        })?;
        Ok(Self(hash_data(&serialized)))
    }

    /// Creates a ContentHash from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a ContentHash from a hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|_| SyncError::validation("Invalid hex string for ContentHash"))?;
        let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            SyncError::validation("ContentHash must be exactly 32 bytes (64 hex characters)")
        })?;
        Ok(Self(arr))
    }

    /// Returns a short form of the hash for display (first 8 bytes / 16 hex chars).
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({}...)", self.short())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// Returns the current Unix timestamp in milliseconds.
pub fn current_timestamp_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_compute() {
        let hash1 = ContentHash::compute(&"test data").unwrap();
        let hash2 = ContentHash::compute(&"test data").unwrap();
        assert_eq!(hash1, hash2, "Same data should produce same hash");

        let hash3 = ContentHash::compute(&"other data").unwrap();
        assert_ne!(hash1, hash3, "Different data should produce different hash");
    }

    #[test]
    fn test_content_hash_hex_roundtrip() {
        let hash = ContentHash::compute(&"test data").unwrap();
        let parsed = ContentHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
        assert!(ContentHash::from_hex("abcd").is_err());
    }

    #[test]
    fn test_content_hash_orders_by_bytes() {
        let low = ContentHash::from_bytes([0x01; 32]);
        let mut high_bytes = [0x01; 32];
        high_bytes[0] = 0x02;
        let high = ContentHash::from_bytes(high_bytes);
        assert!(low < high);
    }

    #[test]
    fn test_content_hash_encodes_as_fixed_array() {
        let hash = ContentHash::compute(&42u32).unwrap();
        assert_eq!(bincode::serialize(&hash).unwrap().len(), 32);
    }
}
