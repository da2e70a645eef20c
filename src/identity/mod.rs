//! Identity: wallets, delegated signing keys and author verification.
//!
//! - `wallet`: wallet capability traits and an in-process wallet
//! - `delegation`: grants, the local grant manager and message verification
//! - `directory`: verification tiers and resolved identities

pub mod delegation;
pub mod directory;
pub mod wallet;

pub use delegation::{
    auth_message, DelegationGrant, DelegationManager, DelegationProof, MessageVerifier, NONCE_SIZE,
};
pub use directory::{
    resolve, IdentityDirectory, IdentityRecord, IdentityResolver, NoopResolver, OwnershipKind,
    OwnershipProof, StaticResolver, VerificationTier,
};
pub use wallet::{
    local_address, ChainVerifier, LocalKeyVerifier, LocalKeyWallet, WalletAccount, WalletAdapter,
    WalletKind, WalletVerifiers,
};
