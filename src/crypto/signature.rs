//! Digital signature operations.
//!
//! Ed25519 signs the message directly. ML-DSA-87 signs the SHA3-256 digest
//! of the message, as a detached signature.

use crate::crypto::keys::{PrivateKey, PublicKey};
use crate::crypto::{hash_data, KeyScheme};
use crate::error::{Result, SyncError};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use pqcrypto_mldsa::mldsa87;
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _, SecretKey as _};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A detached signature tagged with the scheme that produced it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// The scheme used to sign
    pub scheme: KeyScheme,
    /// The raw signature bytes
    pub signature_bytes: Vec<u8>,
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signature")
            .field("scheme", &self.scheme)
            .field("signature_size", &self.signature_bytes.len())
            .finish()
    }
}

impl Signature {
    /// Returns the size of the signature in bytes
    pub fn size(&self) -> usize {
        self.signature_bytes.len()
    }
}

fn ed25519_signing_key(private_key: &PrivateKey) -> Result<SigningKey> {
    let bytes: [u8; 32] = private_key
        .as_bytes()
        .try_into()
        .map_err(|_| SyncError::key("Ed25519 private key must be 32 bytes"))?;
    Ok(SigningKey::from_bytes(&bytes))
}

fn ed25519_verifying_key(public_key: &PublicKey) -> Result<VerifyingKey> {
    let bytes: [u8; 32] = public_key
        .as_bytes()
        .try_into()
        .map_err(|_| SyncError::key("Ed25519 public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| SyncError::key(format!("Invalid Ed25519 public key: {}", e)))
}

/// Signs a message with the given private key.
pub fn sign_message(private_key: &PrivateKey, message: &[u8]) -> Result<Signature> {
    let signature_bytes = match private_key.scheme() {
        KeyScheme::Ed25519 => {
            let signing_key = ed25519_signing_key(private_key)?;
            signing_key.sign(message).to_bytes().to_vec()
        }
        KeyScheme::MlDsa87 => {
            let secret_key = mldsa87::SecretKey::from_bytes(private_key.as_bytes())
                .map_err(|_| SyncError::key("Failed to reconstruct ML-DSA-87 secret key"))?;
            let message_hash = hash_data(message);
            mldsa87::detached_sign(&message_hash, &secret_key)
                .as_bytes()
                .to_vec()
        }
    };

    Ok(Signature {
        scheme: private_key.scheme(),
        signature_bytes,
    })
}

/// Verifies a detached signature over `message`.
///
/// # Errors
/// Returns `SignatureInvalid` if the schemes differ, the key or signature
/// bytes are malformed, or the signature does not verify.
pub fn verify_signature(public_key: &PublicKey, message: &[u8], signature: &Signature) -> Result<()> {
    if public_key.scheme() != signature.scheme {
        return Err(SyncError::signature(
            "Key scheme doesn't match signature scheme",
        ));
    }

    match signature.scheme {
        KeyScheme::Ed25519 => {
            let verifying_key =
                ed25519_verifying_key(public_key).map_err(|e| SyncError::signature(e))?;
            let sig = ed25519_dalek::Signature::from_slice(&signature.signature_bytes)
                .map_err(|_| SyncError::signature("Malformed Ed25519 signature"))?;
            verifying_key
                .verify_strict(message, &sig)
                .map_err(|_| SyncError::signature("Signature verification failed"))
        }
        KeyScheme::MlDsa87 => {
            let pk = mldsa87::PublicKey::from_bytes(public_key.as_bytes())
                .map_err(|_| SyncError::signature("Malformed ML-DSA-87 public key"))?;
            let detached = mldsa87::DetachedSignature::from_bytes(&signature.signature_bytes)
                .map_err(|_| SyncError::signature("Malformed ML-DSA-87 signature"))?;
            let message_hash = hash_data(message);
            mldsa87::verify_detached_signature(&detached, &message_hash, &pk)
                .map_err(|_| SyncError::signature("Signature verification failed"))
        }
    }
}

/// Creates a signature over structured data (serialized with bincode first)
pub fn sign_data<T: Serialize>(private_key: &PrivateKey, data: &T) -> Result<Signature> {
    let serialized = bincode::serialize(data)
        .map_err(|e| SyncError::serialization(format!("Failed to serialize data: {}", e)))?;
    sign_message(private_key, &serialized)
}

/// Verifies a signature over structured data
pub fn verify_data_signature<T: Serialize>(
    public_key: &PublicKey,
    data: &T,
    signature: &Signature,
) -> Result<()> {
    let serialized = bincode::serialize(data)
        .map_err(|e| SyncError::serialization(format!("Failed to serialize data: {}", e)))?;
    verify_signature(public_key, &serialized, signature)
}
