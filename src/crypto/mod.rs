//! Cryptographic primitives for cellsync.
//!
//! Two signature schemes are supported, selected by a tag carried on every
//! key and signature:
//!
//! - **Ed25519**: classic elliptic-curve signatures, the default ephemeral key
//! - **ML-DSA-87**: NIST-standardized post-quantum signatures
//! - **SHA3**: hashing for message ids and signing digests
//!
//! The scheme of a delegated key never depends on the wallet chain that
//! authorized it.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;

pub mod keys;
pub mod signature;
pub mod timing;

pub use keys::{KeyPair, PrivateKey, PublicKey};
pub use signature::{sign_data, sign_message, verify_data_signature, verify_signature, Signature};
pub use timing::TimingSafe;

/// Signature scheme tag carried on keys and signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum KeyScheme {
    /// Ed25519 (RFC 8032)
    Ed25519 = 1,
    /// ML-DSA-87 (FIPS 204)
    MlDsa87 = 2,
}

impl KeyScheme {
    /// Returns the scheme name as a string
    pub fn name(&self) -> &'static str {
        match self {
            KeyScheme::Ed25519 => "Ed25519",
            KeyScheme::MlDsa87 => "ML-DSA-87",
        }
    }

    /// Returns the public key size in bytes for this scheme
    pub fn public_key_size(&self) -> usize {
        match self {
            KeyScheme::Ed25519 => 32,
            KeyScheme::MlDsa87 => 2592,
        }
    }

    /// Returns true if this is a post-quantum scheme
    pub fn is_post_quantum(&self) -> bool {
        matches!(self, KeyScheme::MlDsa87)
    }
}

impl fmt::Display for KeyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Cryptographic hash function using SHA3-256
pub fn hash_data(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_data_deterministic() {
        assert_eq!(hash_data(b"cell"), hash_data(b"cell"));
        assert_ne!(hash_data(b"cell"), hash_data(b"post"));
    }

    #[test]
    fn test_scheme_sizes() {
        assert_eq!(KeyScheme::Ed25519.public_key_size(), 32);
        assert!(KeyScheme::MlDsa87.is_post_quantum());
        assert!(!KeyScheme::Ed25519.is_post_quantum());
    }
}
