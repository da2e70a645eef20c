//! Signed message envelope and wire codec.
//!
//! A message is a [`MessageBody`] plus a signature over its bincode
//! encoding. The body carries every field except the signature, including the
//! id and the optional delegation proof, so none of them can be altered in
//! transit. Bincode encodes struct fields in declaration order with fixed-width
//! integers, which makes the encoding canonical.
//!
//! The id is derived from the signer key, the payload hash and the timestamp,
//! so a retransmitted message always carries the same id.

use crate::crypto::{sign_message, verify_signature, KeyPair, PrivateKey, PublicKey, Signature};
use crate::dag::DagNodeOps;
use crate::error::{Result, SyncError};
use crate::forum::constants::MAX_FRAME_SIZE;
use crate::forum::payload::Payload;
use crate::forum::types::{Address, ContentHash, MessageKind};
use crate::identity::DelegationProof;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Every field of a message except its signature.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageBody {
    /// Deterministic message id.
    pub id: ContentHash,
    /// Variant discriminator, must match the payload.
    pub kind: MessageKind,
    /// Author-claimed creation time in milliseconds.
    pub timestamp: u64,
    /// Key that signed this message.
    pub signer_public_key: PublicKey,
    /// Variant payload.
    pub payload: Payload,
    /// Wallet authorization for `signer_public_key`, if delegated.
    pub delegation_proof: Option<DelegationProof>,
}

impl fmt::Debug for MessageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBody")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("timestamp", &self.timestamp)
            .field("delegated", &self.delegation_proof.is_some())
            .finish()
    }
}

/// Produces the canonical byte encoding used for signing.
pub fn encode(body: &MessageBody) -> Result<Vec<u8>> {
    bincode::serialize(body)
        .map_err(|e| SyncError::serialization(format!("Failed to encode message: {}", e)))
}

/// Signs canonical bytes.
pub fn sign(encoded: &[u8], private_key: &PrivateKey) -> Result<Signature> {
    sign_message(private_key, encoded)
}

/// Verifies a signature over canonical bytes.
pub fn verify(encoded: &[u8], signature: &Signature, public_key: &PublicKey) -> Result<()> {
    verify_signature(public_key, encoded, signature)
}

/// Derives the id of a message.
///
/// `SHA3-256(bincode(kind, fingerprint(signer), SHA3-256(bincode(payload)), timestamp))`
pub fn derive_id(
    kind: MessageKind,
    payload: &Payload,
    signer_public_key: &PublicKey,
    timestamp: u64,
) -> Result<ContentHash> {
    let payload_hash = ContentHash::compute(payload)?;
    ContentHash::compute(&(kind, signer_public_key.fingerprint(), payload_hash, timestamp))
}

/// A message with its signature, as it travels on the wire.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedMessage {
    body: MessageBody,
    signature: Signature,
}

impl fmt::Debug for SignedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedMessage")
            .field("id", &self.body.id)
            .field("kind", &self.body.kind)
            .field("timestamp", &self.body.timestamp)
            .field("signature", &self.signature)
            .finish()
    }
}

impl SignedMessage {
    /// Builds, identifies and signs a message.
    ///
    /// `delegation_proof` must authorize `signer.public_key()` for the
    /// message to verify downstream; this is not checked here.
    pub fn create(
        payload: Payload,
        timestamp: u64,
        signer: &KeyPair,
        delegation_proof: Option<DelegationProof>,
    ) -> Result<Self> {
        payload.validate()?;
        let kind = payload.kind();
        let signer_public_key = signer.public_key().clone();
        let id = derive_id(kind, &payload, &signer_public_key, timestamp)?;
        let body = MessageBody {
            id,
            kind,
            timestamp,
            signer_public_key,
            payload,
            delegation_proof,
        };
        let signature = sign(&encode(&body)?, signer.private_key())?;
        Ok(Self { body, signature })
    }

    /// Checks the id derivation, the kind tag and the signature.
    ///
    /// Delegation proofs are checked separately by the identity layer.
    ///
    /// # Errors
    /// Returns `SignatureInvalid` on any mismatch.
    pub fn verify_integrity(&self) -> Result<()> {
        if self.body.kind != self.body.payload.kind() {
            return Err(SyncError::signature(format!(
                "Kind tag {} does not match payload {}",
                self.body.kind,
                self.body.payload.kind()
            )));
        }
        let expected = derive_id(
            self.body.kind,
            &self.body.payload,
            &self.body.signer_public_key,
            self.body.timestamp,
        )?;
        if expected != self.body.id {
            return Err(SyncError::signature("Message id mismatch"));
        }
        verify(
            &encode(&self.body)?,
            &self.signature,
            &self.body.signer_public_key,
        )
    }

    /// Encodes this message as a transport frame.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| SyncError::serialization(format!("Failed to encode frame: {}", e)))
    }

    /// Decodes a transport frame.
    ///
    /// Frames above `MAX_FRAME_SIZE` or with trailing bytes are rejected.
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(SyncError::validation(format!(
                "Frame of {} bytes exceeds maximum of {}",
                frame.len(),
                MAX_FRAME_SIZE
            )));
        }
        bincode::options()
            .with_fixint_encoding()
            .with_limit(MAX_FRAME_SIZE as u64)
            .deserialize(frame)
            .map_err(|e| SyncError::serialization(format!("Failed to decode frame: {}", e)))
    }

    /// Returns the message id.
    pub fn id(&self) -> &ContentHash {
        &self.body.id
    }

    /// Returns the message kind.
    pub fn kind(&self) -> MessageKind {
        self.body.kind
    }

    /// Returns the author-claimed timestamp.
    pub fn timestamp(&self) -> u64 {
        self.body.timestamp
    }

    /// Returns the signing key.
    pub fn signer_public_key(&self) -> &PublicKey {
        &self.body.signer_public_key
    }

    /// Returns the payload.
    pub fn payload(&self) -> &Payload {
        &self.body.payload
    }

    /// Returns the delegation proof, if any.
    pub fn delegation_proof(&self) -> Option<&DelegationProof> {
        self.body.delegation_proof.as_ref()
    }

    /// Returns the signature.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Returns the full body.
    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// Returns the claimed author.
    ///
    /// Only meaningful once the delegation proof has been verified.
    pub fn claimed_author(&self) -> Address {
        match &self.body.delegation_proof {
            Some(proof) => proof.wallet_address.clone(),
            None => Address::anonymous(&self.body.signer_public_key),
        }
    }
}

impl DagNodeOps for SignedMessage {
    fn hash(&self) -> &ContentHash {
        self.id()
    }

    fn parent_hashes(&self) -> Vec<ContentHash> {
        self.payload().references()
    }

    fn created_at(&self) -> u64 {
        self.timestamp()
    }
}

/// A message whose signature and delegation proof have been checked.
///
/// Only the verification pipeline constructs these; the reducer accepts
/// nothing else.
#[derive(Clone, PartialEq, Eq)]
pub struct VerifiedMessage {
    message: SignedMessage,
    author: Address,
}

impl fmt::Debug for VerifiedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifiedMessage")
            .field("id", self.id())
            .field("kind", &self.kind())
            .field("author", &self.author)
            .finish()
    }
}

impl VerifiedMessage {
    pub(crate) fn new(message: SignedMessage, author: Address) -> Self {
        Self { message, author }
    }

    /// Returns the verified author.
    pub fn author(&self) -> &Address {
        &self.author
    }

    /// Returns the underlying signed message.
    pub fn message(&self) -> &SignedMessage {
        &self.message
    }

    /// Returns the message id.
    pub fn id(&self) -> &ContentHash {
        self.message.id()
    }

    /// Returns the message kind.
    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Returns the author-claimed timestamp.
    pub fn timestamp(&self) -> u64 {
        self.message.timestamp()
    }

    /// Returns the payload.
    pub fn payload(&self) -> &Payload {
        self.message.payload()
    }

    /// Unwraps to the signed message.
    pub fn into_message(self) -> SignedMessage {
        self.message
    }
}

impl DagNodeOps for VerifiedMessage {
    fn hash(&self) -> &ContentHash {
        self.id()
    }

    fn parent_hashes(&self) -> Vec<ContentHash> {
        self.payload().references()
    }

    fn created_at(&self) -> u64 {
        self.timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyScheme;
    use crate::forum::payload::{CellCreate, VoteCast};
    use crate::forum::types::TargetKind;

    fn cell_payload() -> Payload {
        CellCreate::new("rust".into(), "systems".into(), None)
            .unwrap()
            .into()
    }

    #[test]
    fn test_id_is_deterministic() {
        let keypair = KeyPair::generate_ed25519().unwrap();
        let a = SignedMessage::create(cell_payload(), 1_700_000_000_000, &keypair, None).unwrap();
        let b = SignedMessage::create(cell_payload(), 1_700_000_000_000, &keypair, None).unwrap();
        assert_eq!(a.id(), b.id());

        let later = SignedMessage::create(cell_payload(), 1_700_000_000_001, &keypair, None).unwrap();
        assert_ne!(a.id(), later.id());
    }

    #[test]
    fn test_frame_roundtrip_verifies() {
        let keypair = KeyPair::generate_ed25519().unwrap();
        let message = SignedMessage::create(cell_payload(), 1_700_000_000_000, &keypair, None).unwrap();
        let decoded = SignedMessage::from_frame(&message.to_frame().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert!(decoded.verify_integrity().is_ok());
    }

    #[test]
    fn test_mldsa_signer_verifies() {
        let keypair = KeyPair::generate_mldsa87().unwrap();
        let message = SignedMessage::create(cell_payload(), 1_700_000_000_000, &keypair, None).unwrap();
        assert_eq!(message.signature().scheme, KeyScheme::MlDsa87);
        assert!(message.verify_integrity().is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let keypair = KeyPair::generate_ed25519().unwrap();
        let target = ContentHash::compute(&"post").unwrap();
        let mut message = SignedMessage::create(
            VoteCast::new(target, TargetKind::Post, true).into(),
            1_700_000_000_000,
            &keypair,
            None,
        )
        .unwrap();
        message.body.payload = VoteCast::new(target, TargetKind::Post, false).into();
        assert!(matches!(
            message.verify_integrity(),
            Err(SyncError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let keypair = KeyPair::generate_ed25519().unwrap();
        let message = SignedMessage::create(cell_payload(), 1_700_000_000_000, &keypair, None).unwrap();
        let mut frame = message.to_frame().unwrap();
        frame.push(0);
        assert!(SignedMessage::from_frame(&frame).is_err());
    }

    #[test]
    fn test_anonymous_author() {
        let keypair = KeyPair::generate_ed25519().unwrap();
        let message = SignedMessage::create(cell_payload(), 1_700_000_000_000, &keypair, None).unwrap();
        assert!(message.claimed_author().is_anonymous());
    }
}
