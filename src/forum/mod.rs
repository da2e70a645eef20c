//! Forum messages and the state derived from them.
//!
//! Every forum action is an immutable, signed [`SignedMessage`]. A message
//! is:
//! - **Content-addressed**: its id derives from signer, payload and timestamp
//! - **Signed**: Ed25519 or ML-DSA-87, selected by the signer key's scheme
//! - **Linked**: payloads reference their parents by id
//!
//! ## Hierarchy
//!
//! ```text
//! CellCreate
//!     ├── PostCreate
//!     │       ├── CommentCreate
//!     │       └── Vote / Moderate (post)
//!     └── Moderate (user in cell)
//! ```
//!
//! `ProfileUpdate` has no parent.
//!
//! ## Rebuildability
//!
//! Given every message ever published, any client rebuilds the same state by
//! verifying each message and folding it into a [`ForumState`], parents
//! first. No central authority is required.

pub mod constants;
pub mod message;
pub mod payload;
pub mod permissions;
pub mod relevance;
pub mod state;
pub mod storage;
pub mod types;
pub mod validation;

pub use message::{SignedMessage, VerifiedMessage};
pub use payload::{
    CellCreate, CommentCreate, Moderate, Payload, PostCreate, ProfileUpdate, VoteCast,
};
pub use permissions::{authorize_moderation, Authorization, PermissionEngine};
pub use relevance::{RelevanceScorer, ScoreBreakdown};
pub use state::{
    ApplyOutcome, AuditEntry, Cell, Comment, ForumState, ModerationRecord, Post, Profile, Vote,
    VoteTally,
};
pub use storage::ForumStorage;
pub use types::{
    Address, ContentHash, MessageKind, ModerationAction, ModerationStatus, ModerationTarget,
    TargetKind,
};
pub use validation::{validate_message, ValidationResult};
