//! Forum-specific types.
//!
//! - `MessageKind`: discriminator for the six message variants
//! - `Address`: an author identity (wallet address or anonymous key)
//! - `TargetKind`, `ModerationTarget`, `ModerationAction`: reference types
//! - `ModerationStatus`: the tagged moderation state of an entity
//!
//! For `ContentHash`, see the `dag` module.

use crate::crypto::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use crate::dag::{current_timestamp_millis, ContentHash};

/// Type discriminator for messages.
///
/// The discriminator is part of the signed body, so a payload cannot be
/// replayed under a different kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Creates a cell (community).
    CellCreate = 1,
    /// Creates a post in a cell.
    PostCreate = 2,
    /// Creates a comment on a post.
    CommentCreate = 3,
    /// Up- or down-votes a post or comment.
    Vote = 4,
    /// Moderates or unmoderates a post, comment or user.
    Moderate = 5,
    /// Updates the author's profile.
    ProfileUpdate = 6,
}

impl MessageKind {
    /// All kinds, in discriminant order.
    pub const ALL: [MessageKind; 6] = [
        MessageKind::CellCreate,
        MessageKind::PostCreate,
        MessageKind::CommentCreate,
        MessageKind::Vote,
        MessageKind::Moderate,
        MessageKind::ProfileUpdate,
    ];

    /// Returns the topic segment used for this kind.
    pub fn topic_name(&self) -> &'static str {
        match self {
            MessageKind::CellCreate => "cell",
            MessageKind::PostCreate => "post",
            MessageKind::CommentCreate => "comment",
            MessageKind::Vote => "vote",
            MessageKind::Moderate => "moderate",
            MessageKind::ProfileUpdate => "profile",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::CellCreate => write!(f, "CellCreate"),
            MessageKind::PostCreate => write!(f, "PostCreate"),
            MessageKind::CommentCreate => write!(f, "CommentCreate"),
            MessageKind::Vote => write!(f, "Vote"),
            MessageKind::Moderate => write!(f, "Moderate"),
            MessageKind::ProfileUpdate => write!(f, "ProfileUpdate"),
        }
    }
}

/// Prefix marking an address derived from a bare signing key.
pub const ANONYMOUS_PREFIX: &str = "anon:";

/// An author identity.
///
/// Delegated messages are authored by the wallet address that authorized the
/// signing key. Messages without a delegation proof are authored by the key
/// itself, rendered as `anon:<fingerprint hex>`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Wraps a wallet address string.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Derives the anonymous address of a signing key.
    pub fn anonymous(key: &PublicKey) -> Self {
        Self(format!("{}{}", ANONYMOUS_PREFIX, hex::encode(key.fingerprint())))
    }

    /// Returns true if this address was derived from a bare key.
    pub fn is_anonymous(&self) -> bool {
        self.0.starts_with(ANONYMOUS_PREFIX)
    }

    /// Returns the address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short form for logs.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of entity a vote targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TargetKind {
    /// A post.
    Post = 1,
    /// A comment.
    Comment = 2,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Post => write!(f, "post"),
            TargetKind::Comment => write!(f, "comment"),
        }
    }
}

/// What a moderation message acts on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModerationTarget {
    /// A post; the cell is resolved through the post.
    Post(ContentHash),
    /// A comment; the cell is resolved through comment, then post.
    Comment(ContentHash),
    /// A user, scoped to one cell.
    User {
        /// The cell the user is moderated in.
        cell_id: ContentHash,
        /// The moderated author.
        address: Address,
    },
}

impl ModerationTarget {
    /// Returns the id this target depends on locally.
    pub fn dependency(&self) -> ContentHash {
        match self {
            ModerationTarget::Post(id) | ModerationTarget::Comment(id) => *id,
            ModerationTarget::User { cell_id, .. } => *cell_id,
        }
    }
}

impl fmt::Display for ModerationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModerationTarget::Post(id) => write!(f, "post {}", id.short()),
            ModerationTarget::Comment(id) => write!(f, "comment {}", id.short()),
            ModerationTarget::User { cell_id, address } => {
                write!(f, "user {} in cell {}", address.short(), cell_id.short())
            }
        }
    }
}

/// Moderation action types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModerationAction {
    /// Marks the target as moderated.
    Moderate = 1,
    /// Restores a moderated target.
    Unmoderate = 2,
}

impl fmt::Display for ModerationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModerationAction::Moderate => write!(f, "Moderate"),
            ModerationAction::Unmoderate => write!(f, "Unmoderate"),
        }
    }
}

/// Moderation state of a post, comment or user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ModerationStatus {
    /// Not moderated.
    #[default]
    Active,
    /// Moderated by the cell admin.
    Moderated {
        /// Admin address that moderated.
        by: Address,
        /// Stated reason.
        reason: String,
        /// Timestamp of the moderation message.
        at: u64,
    },
}

impl ModerationStatus {
    /// Returns true if moderated.
    pub fn is_moderated(&self) -> bool {
        matches!(self, ModerationStatus::Moderated { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_anonymous_address() {
        let keypair = KeyPair::generate_ed25519().unwrap();
        let address = Address::anonymous(keypair.public_key());
        assert!(address.is_anonymous());
        assert_eq!(address, Address::anonymous(keypair.public_key()));
        assert!(!Address::new("0xabc").is_anonymous());
    }

    #[test]
    fn test_address_short_handles_short_strings() {
        assert_eq!(Address::new("0xab").short(), "0xab");
        assert_eq!(Address::new("0x0123456789abcdef").short(), "0x0123456789");
    }

    #[test]
    fn test_topic_names_unique() {
        let names: std::collections::HashSet<_> =
            MessageKind::ALL.iter().map(|k| k.topic_name()).collect();
        assert_eq!(names.len(), MessageKind::ALL.len());
    }
}
