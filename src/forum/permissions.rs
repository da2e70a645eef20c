//! Permission checks over reducer state.
//!
//! The permission model is:
//! - **Cell admin**: the creator of the cell, fixed at creation. The only
//!   address that may moderate posts, comments and users in the cell.
//! - **Member**: any author at or above the configured tier may create
//!   posts and comments. Creating a cell has its own tier gate.
//!
//! Nothing here mutates state. The reducer calls [`authorize_moderation`]
//! before applying a `Moderate` message; the engine calls
//! [`PermissionEngine::check_submit`] before signing a local action.

use crate::config::PermissionConfig;
use crate::crypto::TimingSafe;
use crate::error::{Result, SyncError};
use crate::forum::payload::Payload;
use crate::forum::state::ForumState;
use crate::forum::types::{Address, ContentHash, ModerationTarget};
use crate::identity::{IdentityDirectory, VerificationTier};

/// Outcome of resolving a moderation target to its cell admin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// The actor is the admin of `cell_id`.
    Authorized {
        /// Cell owning the target.
        cell_id: ContentHash,
    },
    /// The actor is not the admin.
    Unauthorized {
        /// Cell owning the target.
        cell_id: ContentHash,
        /// The actual admin.
        admin: Address,
    },
    /// The target, or an entity on its path to the cell, is not known yet.
    Unresolved(ContentHash),
}

/// Resolves the admin of a target's cell and compares it with `actor`.
///
/// Posts resolve through their cell, comments through post then cell, and
/// user targets name their cell directly.
pub fn authorize_moderation(
    state: &ForumState,
    actor: &Address,
    target: &ModerationTarget,
) -> Authorization {
    let cell_id = match target {
        ModerationTarget::Post(post_id) => match state.post(post_id) {
            Some(post) => post.cell_id,
            None => return Authorization::Unresolved(*post_id),
        },
        ModerationTarget::Comment(comment_id) => {
            let Some(comment) = state.comment(comment_id) else {
                return Authorization::Unresolved(*comment_id);
            };
            match state.post(&comment.post_id) {
                Some(post) => post.cell_id,
                None => return Authorization::Unresolved(comment.post_id),
            }
        }
        ModerationTarget::User { cell_id, .. } => *cell_id,
    };

    let Some(cell) = state.cell(&cell_id) else {
        return Authorization::Unresolved(cell_id);
    };
    if is_same_address(&cell.admin, actor) {
        Authorization::Authorized { cell_id }
    } else {
        Authorization::Unauthorized {
            cell_id,
            admin: cell.admin.clone(),
        }
    }
}

/// Constant-time address comparison.
pub fn is_same_address(a: &Address, b: &Address) -> bool {
    TimingSafe::string_equal(a.as_str(), b.as_str())
}

/// Read-only permission queries.
#[derive(Debug, Clone, Default)]
pub struct PermissionEngine {
    config: PermissionConfig,
}

impl PermissionEngine {
    /// Creates an engine with the given tier gates.
    pub fn new(config: PermissionConfig) -> Self {
        Self { config }
    }

    /// Returns true if `actor` created `cell_id`.
    pub fn is_admin(&self, state: &ForumState, actor: &Address, cell_id: &ContentHash) -> bool {
        state
            .cell(cell_id)
            .is_some_and(|cell| is_same_address(&cell.admin, actor))
    }

    /// Returns true if `actor` may moderate the cell, post or comment `target_id`.
    pub fn can_moderate(&self, state: &ForumState, actor: &Address, target_id: &ContentHash) -> bool {
        state
            .cell_of(target_id)
            .is_some_and(|cell_id| self.is_admin(state, actor, &cell_id))
    }

    /// Returns true if `address` meets the tier required to post.
    pub fn can_post(&self, directory: &IdentityDirectory, address: &Address) -> bool {
        directory.tier(address) >= self.config.min_post_tier
    }

    /// Returns true if `address` meets the tier required to create cells.
    pub fn can_create_cell(&self, directory: &IdentityDirectory, address: &Address) -> bool {
        directory.tier(address) >= self.config.min_cell_tier
    }

    /// Returns the minimum tier to post.
    pub fn min_post_tier(&self) -> VerificationTier {
        self.config.min_post_tier
    }

    /// Checks a local action before it is signed.
    ///
    /// # Errors
    /// Returns `PermissionDenied` if the author may not perform the action.
    pub fn check_submit(
        &self,
        state: &ForumState,
        directory: &IdentityDirectory,
        author: &Address,
        payload: &Payload,
    ) -> Result<()> {
        match payload {
            Payload::CellCreate(_) => {
                if !self.can_create_cell(directory, author) {
                    return Err(SyncError::permission(format!(
                        "Creating a cell requires tier {}",
                        self.config.min_cell_tier
                    )));
                }
            }
            Payload::PostCreate(_) | Payload::CommentCreate(_) => {
                if !self.can_post(directory, author) {
                    return Err(SyncError::permission(format!(
                        "Posting requires tier {}",
                        self.config.min_post_tier
                    )));
                }
            }
            Payload::Moderate(moderate) => {
                if let Authorization::Unauthorized { .. } =
                    authorize_moderation(state, author, &moderate.target)
                {
                    return Err(SyncError::permission(format!(
                        "{} is not the admin of the target's cell",
                        author.short()
                    )));
                }
            }
            Payload::Vote(_) | Payload::ProfileUpdate(_) => {}
        }
        Ok(())
    }
}
