//! Identity directory: verification tiers and resolved names.
//!
//! Tiers are derived, never claimed. An anonymous key is `Anonymous`, any
//! wallet-authored message makes its author `WalletConnected`, and an
//! ownership proof from the [`IdentityResolver`] lifts it to
//! `OwnershipVerified`.

use crate::dag::current_timestamp_millis;
use crate::error::Result;
use crate::forum::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use tracing::debug;

/// How strongly an author's identity is established.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum VerificationTier {
    /// A bare signing key with no wallet behind it.
    #[default]
    Anonymous,
    /// Authored through a wallet delegation.
    WalletConnected,
    /// The wallet holds a name or asset the resolver could prove.
    OwnershipVerified,
}

impl fmt::Display for VerificationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationTier::Anonymous => write!(f, "anonymous"),
            VerificationTier::WalletConnected => write!(f, "wallet-connected"),
            VerificationTier::OwnershipVerified => write!(f, "ownership-verified"),
        }
    }
}

/// What a resolver proved the wallet owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnershipKind {
    /// A name-service record (ENS on Ethereum).
    NameRecord,
    /// An inscribed asset (ordinals on Bitcoin).
    InscribedAsset,
}

/// Ownership evidence returned by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipProof {
    /// Kind of asset.
    pub kind: OwnershipKind,
    /// Name or asset identifier.
    pub identifier: String,
}

/// External name-service and ownership lookups.
pub trait IdentityResolver: Send + Sync {
    /// Resolves `address` to a display name, if it has one.
    fn resolve_name(&self, address: &Address)
        -> impl Future<Output = Result<Option<String>>> + Send;

    /// Resolves `address` to an ownership proof, if it has one.
    fn resolve_ownership(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<Option<OwnershipProof>>> + Send;
}

/// A resolver that knows nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResolver;

impl IdentityResolver for NoopResolver {
    fn resolve_name(
        &self,
        _address: &Address,
    ) -> impl Future<Output = Result<Option<String>>> + Send {
        std::future::ready(Ok(None))
    }

    fn resolve_ownership(
        &self,
        _address: &Address,
    ) -> impl Future<Output = Result<Option<OwnershipProof>>> + Send {
        std::future::ready(Ok(None))
    }
}

/// A fixed table of names and proofs, for tests and simulations.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    names: HashMap<Address, String>,
    proofs: HashMap<Address, OwnershipProof>,
}

impl StaticResolver {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a display name.
    pub fn with_name(mut self, address: Address, name: impl Into<String>) -> Self {
        self.names.insert(address, name.into());
        self
    }

    /// Adds an ownership proof.
    pub fn with_proof(mut self, address: Address, proof: OwnershipProof) -> Self {
        self.proofs.insert(address, proof);
        self
    }
}

impl IdentityResolver for StaticResolver {
    fn resolve_name(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<Option<String>>> + Send {
        std::future::ready(Ok(self.names.get(address).cloned()))
    }

    fn resolve_ownership(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<Option<OwnershipProof>>> + Send {
        std::future::ready(Ok(self.proofs.get(address).cloned()))
    }
}

/// Everything known about one author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Author address.
    pub address: Address,
    /// Derived tier.
    pub tier: VerificationTier,
    /// Name from the resolver.
    pub resolved_name: Option<String>,
    /// Proof from the resolver.
    pub ownership: Option<OwnershipProof>,
    /// When the resolver last answered, if ever.
    pub resolved_at: Option<u64>,
}

impl IdentityRecord {
    fn unresolved(address: Address) -> Self {
        let tier = if address.is_anonymous() {
            VerificationTier::Anonymous
        } else {
            VerificationTier::WalletConnected
        };
        Self {
            address,
            tier,
            resolved_name: None,
            ownership: None,
            resolved_at: None,
        }
    }
}

/// Looks up one address against a resolver.
///
/// Anonymous addresses are never sent to the resolver.
pub async fn resolve<R: IdentityResolver>(resolver: &R, address: Address) -> Result<IdentityRecord> {
    let mut record = IdentityRecord::unresolved(address);
    if record.address.is_anonymous() {
        return Ok(record);
    }
    record.resolved_name = resolver.resolve_name(&record.address).await?;
    record.ownership = resolver.resolve_ownership(&record.address).await?;
    if record.ownership.is_some() {
        record.tier = VerificationTier::OwnershipVerified;
    }
    record.resolved_at = Some(current_timestamp_millis());
    Ok(record)
}

/// Cache of identity records keyed by address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityDirectory {
    records: HashMap<Address, IdentityRecord>,
}

impl IdentityDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notes an author seen on the wire.
    ///
    /// Returns true the first time a wallet address is seen, meaning it
    /// should be resolved.
    pub fn observe(&mut self, address: &Address) -> bool {
        if self.records.contains_key(address) {
            return false;
        }
        let record = IdentityRecord::unresolved(address.clone());
        let needs_resolution = record.tier != VerificationTier::Anonymous;
        self.records.insert(address.clone(), record);
        needs_resolution
    }

    /// Stores a resolver answer.
    pub fn record(&mut self, record: IdentityRecord) {
        debug!(
            address = record.address.short(),
            tier = %record.tier,
            "Identity resolved"
        );
        self.records.insert(record.address.clone(), record);
    }

    /// Returns the tier of an address.
    ///
    /// Unseen wallet addresses count as wallet-connected.
    pub fn tier(&self, address: &Address) -> VerificationTier {
        match self.records.get(address) {
            Some(record) => record.tier,
            None => IdentityRecord::unresolved(address.clone()).tier,
        }
    }

    /// Returns true if the address is ownership-verified.
    pub fn is_verified(&self, address: &Address) -> bool {
        self.tier(address) == VerificationTier::OwnershipVerified
    }

    /// Returns the record for an address.
    pub fn get(&self, address: &Address) -> Option<&IdentityRecord> {
        self.records.get(address)
    }

    /// Number of known addresses.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no address is known.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_tier_order() {
        assert!(VerificationTier::Anonymous < VerificationTier::WalletConnected);
        assert!(VerificationTier::WalletConnected < VerificationTier::OwnershipVerified);
    }

    #[tokio::test]
    async fn test_resolve_with_proof() {
        let address = Address::new("0xabc");
        let resolver = StaticResolver::new()
            .with_name(address.clone(), "alice.eth")
            .with_proof(
                address.clone(),
                OwnershipProof {
                    kind: OwnershipKind::NameRecord,
                    identifier: "alice.eth".into(),
                },
            );
        let record = resolve(&resolver, address.clone()).await.unwrap();
        assert_eq!(record.tier, VerificationTier::OwnershipVerified);
        assert_eq!(record.resolved_name.as_deref(), Some("alice.eth"));

        let mut directory = IdentityDirectory::new();
        assert!(directory.observe(&address));
        assert_eq!(directory.tier(&address), VerificationTier::WalletConnected);
        directory.record(record);
        assert!(directory.is_verified(&address));
        assert!(!directory.observe(&address));
    }

    #[tokio::test]
    async fn test_anonymous_is_not_resolved() {
        let keypair = KeyPair::generate_ed25519().unwrap();
        let address = Address::anonymous(keypair.public_key());
        let record = resolve(&NoopResolver, address.clone()).await.unwrap();
        assert_eq!(record.tier, VerificationTier::Anonymous);
        assert!(record.resolved_at.is_none());

        let mut directory = IdentityDirectory::new();
        assert!(!directory.observe(&address));
        assert_eq!(directory.tier(&address), VerificationTier::Anonymous);
    }
}
