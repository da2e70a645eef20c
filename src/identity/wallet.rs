//! Wallet capability boundary.
//!
//! A wallet is reached through two traits:
//!
//! - [`WalletAdapter`]: the local, interactive side. It reports the active
//!   account, signs the delegation authorization message and publishes
//!   account changes on a `watch` channel.
//! - [`ChainVerifier`]: the pure side, one per [`WalletKind`], that checks a
//!   wallet signature against an address.
//!
//! Chain-specific signing backends live behind these traits.
//! [`LocalKeyWallet`] and [`LocalKeyVerifier`] are an in-process
//! implementation backed by an Ed25519 key, used by tests and the simulator.

use crate::crypto::{sign_message, verify_signature, KeyPair, KeyScheme, PublicKey, Signature};
use crate::error::{Result, SyncError};
use crate::forum::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Chain family of a wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalletKind {
    /// Bitcoin wallets.
    Bitcoin = 1,
    /// Ethereum wallets.
    Ethereum = 2,
}

impl fmt::Display for WalletKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletKind::Bitcoin => write!(f, "bitcoin"),
            WalletKind::Ethereum => write!(f, "ethereum"),
        }
    }
}

/// The account a wallet currently exposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WalletAccount {
    /// Wallet address.
    pub address: Address,
    /// Chain family.
    pub kind: WalletKind,
}

/// Interactive wallet capability.
pub trait WalletAdapter: Send + Sync {
    /// Returns the connected account, if any.
    fn active_account(&self) -> Option<WalletAccount>;

    /// Asks the wallet to sign `message` with `account`.
    ///
    /// Implementations return `WalletSigningRejected` when the user declines
    /// and `WalletUnavailable` when the account is gone.
    fn sign_auth_message(
        &self,
        message: &[u8],
        account: &WalletAccount,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Returns a receiver that observes every account change.
    fn subscribe_account(&self) -> watch::Receiver<Option<WalletAccount>>;
}

/// Verifies wallet signatures for one chain family.
pub trait ChainVerifier: Send + Sync {
    /// The chain family this verifier handles.
    fn kind(&self) -> WalletKind;

    /// Returns true if `signature` over `message` was produced by `address`.
    fn verify_signature(&self, message: &[u8], signature: &[u8], address: &Address) -> bool;
}

/// Registry of chain verifiers keyed by wallet kind.
#[derive(Clone, Default)]
pub struct WalletVerifiers {
    verifiers: HashMap<WalletKind, Arc<dyn ChainVerifier>>,
}

impl fmt::Debug for WalletVerifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletVerifiers")
            .field("kinds", &self.verifiers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WalletVerifiers {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a verifier, replacing any previous one for its kind.
    pub fn with(mut self, verifier: Arc<dyn ChainVerifier>) -> Self {
        self.verifiers.insert(verifier.kind(), verifier);
        self
    }

    /// Verifies a wallet signature.
    ///
    /// # Errors
    /// Returns `SignatureInvalid` if no verifier is registered for `kind` or
    /// the signature does not verify.
    pub fn verify(
        &self,
        message: &[u8],
        signature: &[u8],
        address: &Address,
        kind: WalletKind,
    ) -> Result<()> {
        let verifier = self.verifiers.get(&kind).ok_or_else(|| {
            SyncError::signature(format!("No verifier registered for {} wallets", kind))
        })?;
        if verifier.verify_signature(message, signature, address) {
            Ok(())
        } else {
            Err(SyncError::signature(format!(
                "Wallet signature does not match {}",
                address.short()
            )))
        }
    }
}

// =============================================================================
// In-process wallet
// =============================================================================

/// Derives the address a local key presents for a chain family.
pub fn local_address(kind: WalletKind, key: &PublicKey) -> Address {
    let fingerprint = key.fingerprint();
    match kind {
        WalletKind::Ethereum => Address::new(format!("0x{}", hex::encode(&fingerprint[12..]))),
        WalletKind::Bitcoin => Address::new(format!("bc1q{}", hex::encode(&fingerprint[..20]))),
    }
}

/// A wallet backed by an in-process Ed25519 key.
///
/// The signature it returns is `public key || signature`, which lets the
/// verifier recover the key and compare its derived address, the way
/// Ethereum signatures are checked by recovery.
pub struct LocalKeyWallet {
    keypair: KeyPair,
    kind: WalletKind,
    account_tx: watch::Sender<Option<WalletAccount>>,
    rejecting: AtomicBool,
}

impl fmt::Debug for LocalKeyWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyWallet")
            .field("kind", &self.kind)
            .field("account", &*self.account_tx.borrow())
            .finish()
    }
}

impl LocalKeyWallet {
    /// Creates a connected wallet with a fresh key.
    pub fn generate(kind: WalletKind) -> Result<Self> {
        let keypair = KeyPair::generate_ed25519()?;
        let account = WalletAccount {
            address: local_address(kind, keypair.public_key()),
            kind,
        };
        let (account_tx, _) = watch::channel(Some(account));
        Ok(Self {
            keypair,
            kind,
            account_tx,
            rejecting: AtomicBool::new(false),
        })
    }

    /// Returns the address this wallet presents.
    pub fn address(&self) -> Address {
        local_address(self.kind, self.keypair.public_key())
    }

    /// Disconnects the account; subscribers observe `None`.
    pub fn disconnect(&self) {
        self.account_tx.send_replace(None);
    }

    /// Reconnects the account.
    pub fn connect(&self) {
        self.account_tx.send_replace(Some(WalletAccount {
            address: self.address(),
            kind: self.kind,
        }));
    }

    /// Makes subsequent signing requests fail as if the user declined.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }
}

impl WalletAdapter for LocalKeyWallet {
    fn active_account(&self) -> Option<WalletAccount> {
        self.account_tx.borrow().clone()
    }

    fn sign_auth_message(
        &self,
        message: &[u8],
        account: &WalletAccount,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send {
        let result = if self.rejecting.load(Ordering::SeqCst) {
            Err(SyncError::wallet_rejected("User declined the signature request"))
        } else if self.active_account().as_ref() != Some(account) {
            Err(SyncError::wallet_unavailable(format!(
                "Account {} is not connected",
                account.address.short()
            )))
        } else {
            sign_message(self.keypair.private_key(), message).map(|signature| {
                let mut bytes = self.keypair.public_key().as_bytes().to_vec();
                bytes.extend_from_slice(&signature.signature_bytes);
                bytes
            })
        };
        async move { result }
    }

    fn subscribe_account(&self) -> watch::Receiver<Option<WalletAccount>> {
        self.account_tx.subscribe()
    }
}

/// Verifies signatures produced by [`LocalKeyWallet`].
#[derive(Debug, Clone, Copy)]
pub struct LocalKeyVerifier {
    kind: WalletKind,
}

impl LocalKeyVerifier {
    /// Creates a verifier for one chain family.
    pub fn new(kind: WalletKind) -> Self {
        Self { kind }
    }

    /// A registry with local verifiers for both chain families.
    pub fn registry() -> WalletVerifiers {
        WalletVerifiers::new()
            .with(Arc::new(Self::new(WalletKind::Bitcoin)))
            .with(Arc::new(Self::new(WalletKind::Ethereum)))
    }
}

impl ChainVerifier for LocalKeyVerifier {
    fn kind(&self) -> WalletKind {
        self.kind
    }

    fn verify_signature(&self, message: &[u8], signature: &[u8], address: &Address) -> bool {
        let key_len = KeyScheme::Ed25519.public_key_size();
        if signature.len() <= key_len {
            return false;
        }
        let (key_bytes, signature_bytes) = signature.split_at(key_len);
        let Ok(key) = PublicKey::from_bytes(KeyScheme::Ed25519, key_bytes.to_vec()) else {
            return false;
        };
        if &local_address(self.kind, &key) != address {
            return false;
        }
        let signature = Signature {
            scheme: KeyScheme::Ed25519,
            signature_bytes: signature_bytes.to_vec(),
        };
        verify_signature(&key, message, &signature).is_ok()
    }
}
