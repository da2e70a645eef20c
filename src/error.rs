//! Error types for cellsync operations.
//!
//! Errors fall into two groups. Verification, authorization and missing
//! reference failures are absorbed by the engine (the offending message is
//! dropped or audited and counted). Signing and publishing failures surface
//! to the local caller, who has to retry, reconnect or re-approve a wallet.

use thiserror::Error;

/// Result type alias for cellsync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for cellsync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Message or delegation signature did not verify
    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    /// Moderation attempted by someone other than the cell admin
    #[error("Unauthorized action: {0}")]
    UnauthorizedAction(String),

    /// No unexpired delegation grant is available for signing
    #[error("No valid delegation")]
    NoValidDelegation,

    /// The wallet refused or the user cancelled the signing request
    #[error("Wallet signing rejected: {0}")]
    WalletSigningRejected(String),

    /// The wallet did not answer within the configured wait
    #[error("Wallet signing timed out after {0} ms")]
    WalletSigningTimeout(u64),

    /// No wallet account is connected
    #[error("Wallet unavailable: {0}")]
    WalletUnavailable(String),

    /// Publish or subscribe failure reported by the transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Publish acknowledgement did not arrive in time; outcome unknown
    #[error("Publish timed out after {0} ms")]
    PublishTimeout(u64),

    /// A referenced entity never arrived within the recovery horizon
    #[error("Permanently missing reference: {0}")]
    PermanentlyMissingReference(String),

    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Key parsing or generation errors
    #[error("Key error: {0}")]
    Key(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Input validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Local permission check failed before publishing
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Storage backend errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The engine loop has shut down
    #[error("Sync engine stopped")]
    EngineStopped,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a new signature error.
    pub fn signature<T: ToString>(msg: T) -> Self {
        Self::SignatureInvalid(msg.to_string())
    }

    /// Creates a new unauthorized action error.
    pub fn unauthorized<T: ToString>(msg: T) -> Self {
        Self::UnauthorizedAction(msg.to_string())
    }

    /// Creates a new wallet rejection error.
    pub fn wallet_rejected<T: ToString>(msg: T) -> Self {
        Self::WalletSigningRejected(msg.to_string())
    }

    /// Creates a new wallet unavailable error.
    pub fn wallet_unavailable<T: ToString>(msg: T) -> Self {
        Self::WalletUnavailable(msg.to_string())
    }

    /// Creates a new transport error.
    pub fn transport<T: ToString>(msg: T) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Creates a new cryptographic error.
    pub fn crypto<T: ToString>(msg: T) -> Self {
        Self::Crypto(msg.to_string())
    }

    /// Creates a new key error.
    pub fn key<T: ToString>(msg: T) -> Self {
        Self::Key(msg.to_string())
    }

    /// Creates a new serialization error.
    pub fn serialization<T: ToString>(msg: T) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Creates a new validation error.
    pub fn validation<T: ToString>(msg: T) -> Self {
        Self::Validation(msg.to_string())
    }

    /// Creates a new permission error.
    pub fn permission<T: ToString>(msg: T) -> Self {
        Self::PermissionDenied(msg.to_string())
    }

    /// Creates a new storage error.
    pub fn storage<T: ToString>(msg: T) -> Self {
        Self::Storage(msg.to_string())
    }

    /// Creates a new configuration error.
    pub fn config<T: ToString>(msg: T) -> Self {
        Self::Config(msg.to_string())
    }

    /// Returns true for failures caused by remote input.
    ///
    /// These are dropped or audited inside the engine and never returned to
    /// a local caller.
    pub fn is_recoverable_locally(&self) -> bool {
        matches!(
            self,
            SyncError::SignatureInvalid(_)
                | SyncError::UnauthorizedAction(_)
                | SyncError::Validation(_)
                | SyncError::PermanentlyMissingReference(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_failures_are_local() {
        assert!(SyncError::signature("bad").is_recoverable_locally());
        assert!(SyncError::unauthorized("not admin").is_recoverable_locally());
        assert!(!SyncError::NoValidDelegation.is_recoverable_locally());
        assert!(!SyncError::PublishTimeout(5000).is_recoverable_locally());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::WalletSigningTimeout(30_000);
        assert_eq!(err.to_string(), "Wallet signing timed out after 30000 ms");
    }
}
