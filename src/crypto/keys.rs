//! Signing key generation and management.
//!
//! Keys are stored as raw bytes plus a scheme tag so that they serialize the
//! same way regardless of the backing library.

use crate::crypto::{hash_data, KeyScheme};
use crate::error::{Result, SyncError};
use ed25519_dalek::SigningKey;
use pqcrypto_mldsa::mldsa87;
use pqcrypto_traits::sign::{PublicKey as _, SecretKey as _};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A public verification key tagged with its scheme.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    scheme: KeyScheme,
    key_bytes: Vec<u8>,
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("scheme", &self.scheme)
            .field("fingerprint", &hex::encode(&self.fingerprint()[..8]))
            .finish()
    }
}

impl PublicKey {
    /// Wraps raw key bytes, checking the length for the scheme.
    pub fn from_bytes(scheme: KeyScheme, key_bytes: Vec<u8>) -> Result<Self> {
        if key_bytes.len() != scheme.public_key_size() {
            return Err(SyncError::key(format!(
                "{} public key must be {} bytes, got {}",
                scheme,
                scheme.public_key_size(),
                key_bytes.len()
            )));
        }
        Ok(Self { scheme, key_bytes })
    }

    /// Returns the signature scheme of this key
    pub fn scheme(&self) -> KeyScheme {
        self.scheme
    }

    /// Returns the raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.key_bytes
    }

    /// Returns the hex encoding of the raw key bytes
    pub fn to_hex(&self) -> String {
        hex::encode(&self.key_bytes)
    }

    /// SHA3-256 fingerprint over scheme tag and key bytes.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut data = Vec::with_capacity(1 + self.key_bytes.len());
        data.push(self.scheme as u8);
        data.extend_from_slice(&self.key_bytes);
        hash_data(&data)
    }
}

/// A private signing key. Key material is wiped on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey {
    #[zeroize(skip)]
    scheme: KeyScheme,
    key_bytes: Vec<u8>,
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("scheme", &self.scheme)
            .field("key_bytes", &"[REDACTED]")
            .finish()
    }
}

impl PrivateKey {
    /// Returns the signature scheme of this key
    pub fn scheme(&self) -> KeyScheme {
        self.scheme
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.key_bytes
    }
}

/// A matching public/private key pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    public: PublicKey,
    private: PrivateKey,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish()
    }
}

impl KeyPair {
    /// Generates a key pair for the given scheme.
    pub fn generate(scheme: KeyScheme) -> Result<Self> {
        match scheme {
            KeyScheme::Ed25519 => Self::generate_ed25519(),
            KeyScheme::MlDsa87 => Self::generate_mldsa87(),
        }
    }

    /// Generates a fresh Ed25519 key pair from the OS RNG.
    pub fn generate_ed25519() -> Result<Self> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public = PublicKey::from_bytes(
            KeyScheme::Ed25519,
            signing_key.verifying_key().to_bytes().to_vec(),
        )?;
        let private = PrivateKey {
            scheme: KeyScheme::Ed25519,
            key_bytes: signing_key.to_bytes().to_vec(),
        };
        Ok(Self { public, private })
    }

    /// Generates a fresh ML-DSA-87 key pair.
    ///
    /// `mldsa87::keypair()` draws from its own internal CSPRNG.
    pub fn generate_mldsa87() -> Result<Self> {
        let (public_key, secret_key) = mldsa87::keypair();
        let public = PublicKey::from_bytes(KeyScheme::MlDsa87, public_key.as_bytes().to_vec())?;
        let private = PrivateKey {
            scheme: KeyScheme::MlDsa87,
            key_bytes: secret_key.as_bytes().to_vec(),
        };
        Ok(Self { public, private })
    }

    /// Returns the public half
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Returns the private half
    pub fn private_key(&self) -> &PrivateKey {
        &self.private
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ed25519_key_generation() {
        let keypair = KeyPair::generate_ed25519().unwrap();
        assert_eq!(keypair.public_key().scheme(), KeyScheme::Ed25519);
        assert_eq!(keypair.public_key().as_bytes().len(), 32);
        assert_eq!(keypair.private_key().scheme(), KeyScheme::Ed25519);
    }

    #[test]
    fn test_mldsa87_key_generation() {
        let keypair = KeyPair::generate_mldsa87().unwrap();
        assert_eq!(keypair.public_key().scheme(), KeyScheme::MlDsa87);
        assert_eq!(keypair.public_key().as_bytes().len(), 2592);
    }

    #[test]
    fn test_public_key_length_checked() {
        let result = PublicKey::from_bytes(KeyScheme::Ed25519, vec![0u8; 31]);
        assert!(result.is_err());
    }

    #[test]
    fn test_fingerprint_includes_scheme() {
        let keypair = KeyPair::generate_ed25519().unwrap();
        let other = KeyPair::generate_ed25519().unwrap();
        assert_ne!(
            keypair.public_key().fingerprint(),
            other.public_key().fingerprint()
        );
    }

    #[test]
    fn test_private_key_debug_redacted() {
        let keypair = KeyPair::generate_ed25519().unwrap();
        let debug = format!("{:?}", keypair.private_key());
        assert!(debug.contains("REDACTED"));
    }
}
