//! Delegated signing.
//!
//! A wallet signs one authorization message binding a freshly generated
//! ephemeral key to the wallet address for a bounded window. The ephemeral
//! key then signs every forum action, and each message carries a
//! [`DelegationProof`] so any peer can check the chain of authority:
//!
//! 1. re-derive the authorization message from the proof fields,
//! 2. verify the wallet's signature over it with the chain verifier,
//! 3. check the proof's key is the message signer,
//! 4. check the message timestamp lies inside the grant window.
//!
//! Step 4 uses the message's own timestamp, so a message signed before
//! expiry and delivered late is still accepted.

use crate::config::DelegationConfig;
use crate::crypto::{KeyPair, PublicKey, TimingSafe};
use crate::dag::current_timestamp_millis;
use crate::error::{Result, SyncError};
use crate::forum::constants::MAX_CLOCK_SKEW_MS;
use crate::forum::message::{SignedMessage, VerifiedMessage};
use crate::forum::payload::Payload;
use crate::forum::types::{Address, ContentHash};
use crate::identity::wallet::{WalletAccount, WalletAdapter, WalletKind, WalletVerifiers};
use crate::storage::{KeyValueStore, KeyValueStoreExt, StoreName};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Length of a grant nonce in bytes.
pub const NONCE_SIZE: usize = 16;

/// Builds the canonical authorization text a wallet signs.
pub fn auth_message(
    wallet_address: &Address,
    wallet_kind: WalletKind,
    delegated_public_key: &PublicKey,
    issued_at: u64,
    expires_at: u64,
    nonce: &[u8; NONCE_SIZE],
) -> Vec<u8> {
    format!(
        "cellsync delegation\n\
         wallet: {}\n\
         chain: {}\n\
         key: {} {}\n\
         issued: {}\n\
         expires: {}\n\
         nonce: {}",
        wallet_address,
        wallet_kind,
        delegated_public_key.scheme(),
        hex::encode(delegated_public_key.fingerprint()),
        issued_at,
        expires_at,
        hex::encode(nonce)
    )
    .into_bytes()
}

/// Wallet authorization attached to delegated messages.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelegationProof {
    /// Authorizing wallet address.
    pub wallet_address: Address,
    /// Chain family of the wallet.
    pub wallet_kind: WalletKind,
    /// Key the wallet authorized.
    pub delegated_public_key: PublicKey,
    /// Start of the grant window (inclusive).
    pub issued_at: u64,
    /// End of the grant window (exclusive).
    pub expires_at: u64,
    /// Replay guard.
    pub nonce: [u8; NONCE_SIZE],
    /// Wallet signature over [`auth_message`].
    pub authorizing_signature: Vec<u8>,
}

impl fmt::Debug for DelegationProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegationProof")
            .field("wallet_address", &self.wallet_address)
            .field("wallet_kind", &self.wallet_kind)
            .field("expires_at", &self.expires_at)
            .field("nonce", &hex::encode(self.nonce))
            .finish()
    }
}

impl DelegationProof {
    /// Re-derives the message the wallet signed.
    pub fn auth_message(&self) -> Vec<u8> {
        auth_message(
            &self.wallet_address,
            self.wallet_kind,
            &self.delegated_public_key,
            self.issued_at,
            self.expires_at,
            &self.nonce,
        )
    }

    /// Returns true if `timestamp` lies within the grant window.
    pub fn covers(&self, timestamp: u64) -> bool {
        self.issued_at <= timestamp && timestamp < self.expires_at
    }
}

/// A locally held grant: the proof plus the ephemeral private key.
#[derive(Clone, Serialize, Deserialize)]
pub struct DelegationGrant {
    proof: DelegationProof,
    keypair: KeyPair,
}

impl fmt::Debug for DelegationGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegationGrant")
            .field("proof", &self.proof)
            .field("keypair", &self.keypair)
            .finish()
    }
}

impl DelegationGrant {
    /// Returns the proof carried by delegated messages.
    pub fn proof(&self) -> &DelegationProof {
        &self.proof
    }

    /// Returns the authorizing wallet address.
    pub fn wallet_address(&self) -> &Address {
        &self.proof.wallet_address
    }

    /// Returns the chain family of the authorizing wallet.
    pub fn wallet_kind(&self) -> WalletKind {
        self.proof.wallet_kind
    }

    /// Returns the delegated public key.
    pub fn delegated_public_key(&self) -> &PublicKey {
        &self.proof.delegated_public_key
    }

    /// Returns the grant start.
    pub fn issued_at(&self) -> u64 {
        self.proof.issued_at
    }

    /// Returns the grant expiry.
    pub fn expires_at(&self) -> u64 {
        self.proof.expires_at
    }

    /// Returns true while `now < expires_at`.
    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        now_ms < self.proof.expires_at
    }

    pub(crate) fn keypair(&self) -> &KeyPair {
        &self.keypair
    }
}

// =============================================================================
// Local grant management
// =============================================================================

/// Owns the client's active delegation grant.
///
/// At most one grant is held, for the currently connected wallet address.
/// Grants are persisted in the `delegation` store keyed by wallet address.
pub struct DelegationManager {
    store: Arc<dyn KeyValueStore>,
    config: DelegationConfig,
    active: RwLock<Option<DelegationGrant>>,
    last_timestamp: Mutex<u64>,
}

impl fmt::Debug for DelegationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self
            .active
            .read()
            .ok()
            .and_then(|g| g.as_ref().map(|g| g.wallet_address().clone()));
        f.debug_struct("DelegationManager")
            .field("active", &active)
            .finish()
    }
}

fn lock_error() -> SyncError {
    SyncError::crypto("Delegation state lock poisoned")
}

impl DelegationManager {
    /// Creates a manager with no active grant.
    pub fn new(store: Arc<dyn KeyValueStore>, config: DelegationConfig) -> Self {
        Self {
            store,
            config,
            active: RwLock::new(None),
            last_timestamp: Mutex::new(0),
        }
    }

    /// Loads the persisted grant for `account`, if it is still valid.
    pub fn restore(&self, account: &WalletAccount) -> Result<Option<DelegationGrant>> {
        let key = account.address.as_str().as_bytes();
        let Some(grant) = self.store.get::<DelegationGrant>(StoreName::Delegation, key)? else {
            return Ok(None);
        };
        if grant.wallet_kind() != account.kind || !grant.is_valid_at(current_timestamp_millis()) {
            debug!(wallet = account.address.short(), "Discarding stale persisted grant");
            self.store.delete(StoreName::Delegation, key)?;
            return Ok(None);
        }
        *self.active.write().map_err(|_| lock_error())? = Some(grant.clone());
        info!(
            wallet = account.address.short(),
            expires_at = grant.expires_at(),
            "Restored delegation grant"
        );
        Ok(Some(grant))
    }

    /// Creates, persists and activates a new grant.
    ///
    /// A fresh ephemeral key is generated and the wallet is asked to sign the
    /// authorization message. The wait is bounded by the configured wallet
    /// timeout.
    ///
    /// # Errors
    /// - `WalletUnavailable` if the wallet has no connected account
    /// - `WalletSigningRejected` if the wallet declines
    /// - `WalletSigningTimeout` if the wallet does not answer in time
    pub async fn create_grant<W: WalletAdapter>(
        &self,
        wallet: &W,
        duration: Duration,
    ) -> Result<DelegationGrant> {
        let account = wallet
            .active_account()
            .ok_or_else(|| SyncError::wallet_unavailable("No wallet account connected"))?;

        let keypair = KeyPair::generate(self.config.key_scheme)?;
        let issued_at = current_timestamp_millis();
        let expires_at = issued_at.saturating_add(duration.as_millis() as u64);
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let message = auth_message(
            &account.address,
            account.kind,
            keypair.public_key(),
            issued_at,
            expires_at,
            &nonce,
        );

        let timeout_ms = self.config.wallet_sign_timeout_ms;
        let authorizing_signature = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            wallet.sign_auth_message(&message, &account),
        )
        .await
        .map_err(|_| SyncError::WalletSigningTimeout(timeout_ms))??;

        let grant = DelegationGrant {
            proof: DelegationProof {
                wallet_address: account.address.clone(),
                wallet_kind: account.kind,
                delegated_public_key: keypair.public_key().clone(),
                issued_at,
                expires_at,
                nonce,
                authorizing_signature,
            },
            keypair,
        };

        self.store.put(
            StoreName::Delegation,
            account.address.as_str().as_bytes(),
            &grant,
        )?;
        let previous = self
            .active
            .write()
            .map_err(|_| lock_error())?
            .replace(grant.clone());
        if let Some(previous) = previous {
            if previous.wallet_address() != &account.address {
                self.store.delete(
                    StoreName::Delegation,
                    previous.wallet_address().as_str().as_bytes(),
                )?;
            }
        }

        info!(
            wallet = account.address.short(),
            chain = %account.kind,
            scheme = %grant.delegated_public_key().scheme(),
            expires_at,
            "Created delegation grant"
        );
        Ok(grant)
    }

    /// Returns the active grant, clearing it if it has expired.
    pub fn active_grant(&self) -> Result<Option<DelegationGrant>> {
        self.active_grant_at(current_timestamp_millis())
    }

    /// Like [`active_grant`](Self::active_grant) with an explicit clock.
    pub fn active_grant_at(&self, now_ms: u64) -> Result<Option<DelegationGrant>> {
        let current = self.active.read().map_err(|_| lock_error())?.clone();
        match current {
            Some(grant) if grant.is_valid_at(now_ms) => Ok(Some(grant)),
            Some(grant) => {
                debug!(wallet = grant.wallet_address().short(), "Delegation grant expired");
                self.clear(Some(&grant))?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Drops the active grant immediately. No network effect.
    pub fn revoke(&self) -> Result<()> {
        let current = self.active.read().map_err(|_| lock_error())?.clone();
        if let Some(grant) = &current {
            info!(wallet = grant.wallet_address().short(), "Revoked delegation grant");
        }
        self.clear(current.as_ref())
    }

    fn clear(&self, grant: Option<&DelegationGrant>) -> Result<()> {
        let mut active = self.active.write().map_err(|_| lock_error())?;
        // Only clear if nobody replaced the grant in the meantime.
        let same = match (active.as_ref(), grant) {
            (Some(a), Some(g)) => a.proof == g.proof,
            (None, _) => false,
            (Some(_), None) => true,
        };
        if same {
            *active = None;
        }
        drop(active);
        if let Some(grant) = grant {
            self.store.delete(
                StoreName::Delegation,
                grant.wallet_address().as_str().as_bytes(),
            )?;
        }
        Ok(())
    }

    /// Signs `payload` with the active grant's key, attaching the proof.
    ///
    /// Timestamps are kept strictly increasing per client.
    ///
    /// # Errors
    /// Returns `NoValidDelegation` if no unexpired grant is held.
    pub fn sign_with_delegation(&self, payload: Payload) -> Result<SignedMessage> {
        let now = current_timestamp_millis();
        let grant = self
            .active_grant_at(now)?
            .ok_or(SyncError::NoValidDelegation)?;
        let timestamp = {
            let mut last = self.last_timestamp.lock().map_err(|_| lock_error())?;
            let timestamp = now.max(last.saturating_add(1));
            *last = timestamp;
            timestamp
        };
        if !grant.proof.covers(timestamp) {
            return Err(SyncError::NoValidDelegation);
        }
        SignedMessage::create(payload, timestamp, grant.keypair(), Some(grant.proof.clone()))
    }
}

// =============================================================================
// Verification
// =============================================================================

/// Verifies inbound messages, including their delegation proofs.
///
/// Wallet signature checks are cached per proof. A `(wallet, nonce)` pair
/// already bound to one delegated key is rejected for any other key, until
/// [`prune_expired`](Self::prune_expired) forgets pairs of expired grants.
/// `verify` takes `&self` and is safe to call from several threads.
#[derive(Debug)]
pub struct MessageVerifier {
    wallets: WalletVerifiers,
    nonces: Mutex<HashMap<(Address, [u8; NONCE_SIZE]), TrackedProof>>,
}

#[derive(Debug, Clone, Copy)]
struct TrackedProof {
    proof_hash: ContentHash,
    expires_at: u64,
}

impl MessageVerifier {
    /// Creates a verifier over the given chain verifiers.
    pub fn new(wallets: WalletVerifiers) -> Self {
        Self {
            wallets,
            nonces: Mutex::new(HashMap::new()),
        }
    }

    /// Verifies a message's signature and, if present, its delegation.
    ///
    /// # Errors
    /// Returns `SignatureInvalid` on any verification failure.
    pub fn verify(&self, message: SignedMessage) -> Result<VerifiedMessage> {
        message.verify_integrity()?;
        let author = match message.delegation_proof() {
            Some(proof) => {
                self.verify_delegated_message(&message, proof)?;
                proof.wallet_address.clone()
            }
            None => Address::anonymous(message.signer_public_key()),
        };
        Ok(VerifiedMessage::new(message, author))
    }

    /// Checks the delegation chain of an already signature-checked message.
    pub fn verify_delegated_message(
        &self,
        message: &SignedMessage,
        proof: &DelegationProof,
    ) -> Result<()> {
        let signer = message.signer_public_key();
        if signer.scheme() != proof.delegated_public_key.scheme()
            || !TimingSafe::identity_equal(signer.as_bytes(), proof.delegated_public_key.as_bytes())
        {
            return Err(SyncError::signature(
                "Delegated key does not match message signer",
            ));
        }

        if !proof.covers(message.timestamp()) {
            return Err(SyncError::signature(format!(
                "Message timestamp {} outside delegation window [{}, {})",
                message.timestamp(),
                proof.issued_at,
                proof.expires_at
            )));
        }

        let proof_hash = ContentHash::compute(proof)?;
        let nonce_key = (proof.wallet_address.clone(), proof.nonce);
        {
            let nonces = self.nonces.lock().map_err(|_| lock_error())?;
            match nonces.get(&nonce_key) {
                Some(known) if known.proof_hash == proof_hash => return Ok(()),
                Some(_) => {
                    warn!(
                        wallet = proof.wallet_address.short(),
                        "Delegation nonce reused for a different key"
                    );
                    return Err(SyncError::signature("Delegation nonce already used"));
                }
                None => {}
            }
        }

        self.wallets.verify(
            &proof.auth_message(),
            &proof.authorizing_signature,
            &proof.wallet_address,
            proof.wallet_kind,
        )?;

        let mut nonces = self.nonces.lock().map_err(|_| lock_error())?;
        match nonces.get(&nonce_key) {
            Some(known) if known.proof_hash != proof_hash => {
                Err(SyncError::signature("Delegation nonce already used"))
            }
            _ => {
                nonces.insert(
                    nonce_key,
                    TrackedProof {
                        proof_hash,
                        expires_at: proof.expires_at,
                    },
                );
                Ok(())
            }
        }
    }

    /// Forgets nonces of grants that expired more than the clock skew bound
    /// before `now_ms`. Returns how many were dropped.
    ///
    /// A message signed inside a forgotten grant still verifies; its wallet
    /// signature is checked again.
    pub fn prune_expired(&self, now_ms: u64) -> Result<usize> {
        let mut nonces = self.nonces.lock().map_err(|_| lock_error())?;
        let before = nonces.len();
        nonces.retain(|_, tracked| tracked.expires_at.saturating_add(MAX_CLOCK_SKEW_MS) > now_ms);
        Ok(before - nonces.len())
    }

    /// Number of `(wallet, nonce)` pairs currently tracked.
    pub fn tracked_nonces(&self) -> usize {
        self.nonces.lock().map(|nonces| nonces.len()).unwrap_or(0)
    }
}
