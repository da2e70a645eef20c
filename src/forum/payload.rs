//! Message payloads.
//!
//! Each variant is a plain content struct built through a validating
//! constructor. Payloads hold references to other entities by message id;
//! [`Payload::references`] lists them for the gap detector.

use crate::error::{Result, SyncError};
use crate::forum::constants::{
    MAX_CALL_SIGN_SIZE, MAX_COMMENT_CONTENT_SIZE, MAX_DESCRIPTION_SIZE, MAX_DISPLAY_NAME_SIZE,
    MAX_ICON_SIZE, MAX_NAME_SIZE, MAX_POST_CONTENT_SIZE, MAX_POST_TITLE_SIZE, MAX_REASON_SIZE,
};
use crate::forum::types::{
    ContentHash, MessageKind, ModerationAction, ModerationTarget, TargetKind,
};
use serde::{Deserialize, Serialize};
use std::fmt;

fn check_size(field: &str, value: &str, max: usize) -> Result<()> {
    if value.len() > max {
        return Err(SyncError::validation(format!(
            "{} exceeds maximum size of {} bytes",
            field, max
        )));
    }
    Ok(())
}

fn check_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(SyncError::validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

/// Creates a cell. The author becomes its only admin.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellCreate {
    /// Cell name.
    pub name: String,
    /// Cell description.
    pub description: String,
    /// Optional icon reference (URL or content id).
    pub icon: Option<String>,
}

impl fmt::Debug for CellCreate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellCreate")
            .field("name", &self.name)
            .field("description_len", &self.description.len())
            .field("has_icon", &self.icon.is_some())
            .finish()
    }
}

impl CellCreate {
    /// Creates new cell content.
    ///
    /// # Errors
    /// Returns an error if the name is empty or any field exceeds its limit.
    pub fn new(name: String, description: String, icon: Option<String>) -> Result<Self> {
        let content = Self {
            name,
            description,
            icon,
        };
        content.validate()?;
        Ok(content)
    }

    fn validate(&self) -> Result<()> {
        check_non_empty("Cell name", &self.name)?;
        check_size("Cell name", &self.name, MAX_NAME_SIZE)?;
        check_size("Cell description", &self.description, MAX_DESCRIPTION_SIZE)?;
        if let Some(icon) = &self.icon {
            check_size("Cell icon", icon, MAX_ICON_SIZE)?;
        }
        Ok(())
    }
}

/// Creates a post inside a cell.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostCreate {
    /// Cell the post belongs to.
    pub cell_id: ContentHash,
    /// Post title.
    pub title: String,
    /// Post body.
    pub content: String,
}

impl fmt::Debug for PostCreate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostCreate")
            .field("cell_id", &self.cell_id)
            .field("title", &self.title)
            .field("content_len", &self.content.len())
            .finish()
    }
}

impl PostCreate {
    /// Creates new post content.
    ///
    /// # Errors
    /// Returns an error if title or body is empty or exceeds its limit.
    pub fn new(cell_id: ContentHash, title: String, content: String) -> Result<Self> {
        let post = Self {
            cell_id,
            title,
            content,
        };
        post.validate()?;
        Ok(post)
    }

    fn validate(&self) -> Result<()> {
        check_non_empty("Post title", &self.title)?;
        check_size("Post title", &self.title, MAX_POST_TITLE_SIZE)?;
        check_non_empty("Post content", &self.content)?;
        check_size("Post content", &self.content, MAX_POST_CONTENT_SIZE)
    }
}

/// Creates a comment on a post.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentCreate {
    /// Post the comment belongs to.
    pub post_id: ContentHash,
    /// Comment body.
    pub content: String,
}

impl fmt::Debug for CommentCreate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommentCreate")
            .field("post_id", &self.post_id)
            .field("content_len", &self.content.len())
            .finish()
    }
}

impl CommentCreate {
    /// Creates new comment content.
    pub fn new(post_id: ContentHash, content: String) -> Result<Self> {
        let comment = Self { post_id, content };
        comment.validate()?;
        Ok(comment)
    }

    fn validate(&self) -> Result<()> {
        check_non_empty("Comment content", &self.content)?;
        check_size("Comment content", &self.content, MAX_COMMENT_CONTENT_SIZE)
    }
}

/// A vote on a post or comment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteCast {
    /// Voted entity.
    pub target_id: ContentHash,
    /// Kind of the voted entity.
    pub target_kind: TargetKind,
    /// True for an upvote.
    pub is_upvote: bool,
}

impl VoteCast {
    /// Creates a vote.
    pub fn new(target_id: ContentHash, target_kind: TargetKind, is_upvote: bool) -> Self {
        Self {
            target_id,
            target_kind,
            is_upvote,
        }
    }
}

/// A moderation action by a cell admin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Moderate {
    /// What is moderated.
    pub target: ModerationTarget,
    /// Moderate or unmoderate.
    pub action: ModerationAction,
    /// Free-form reason shown to readers.
    pub reason: String,
}

impl Moderate {
    /// Creates a moderation action.
    pub fn new(target: ModerationTarget, action: ModerationAction, reason: String) -> Result<Self> {
        let moderate = Self {
            target,
            action,
            reason,
        };
        moderate.validate()?;
        Ok(moderate)
    }

    fn validate(&self) -> Result<()> {
        check_size("Moderation reason", &self.reason, MAX_REASON_SIZE)?;
        if let ModerationTarget::User { address, .. } = &self.target {
            check_non_empty("Moderated address", address.as_str())?;
        }
        Ok(())
    }
}

/// Profile update for the author.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileUpdate {
    /// Preferred display name.
    pub display_name: Option<String>,
    /// Short call sign.
    pub call_sign: Option<String>,
}

impl ProfileUpdate {
    /// Creates a profile update.
    pub fn new(display_name: Option<String>, call_sign: Option<String>) -> Result<Self> {
        let profile = Self {
            display_name,
            call_sign,
        };
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> Result<()> {
        if let Some(name) = &self.display_name {
            check_size("Display name", name, MAX_DISPLAY_NAME_SIZE)?;
        }
        if let Some(call_sign) = &self.call_sign {
            check_non_empty("Call sign", call_sign)?;
            check_size("Call sign", call_sign, MAX_CALL_SIGN_SIZE)?;
            if !call_sign
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(SyncError::validation(
                    "Call sign may only contain letters, digits, '_' and '-'",
                ));
            }
        }
        Ok(())
    }
}

/// Tagged union of all payload variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Payload {
    /// Cell creation.
    CellCreate(CellCreate),
    /// Post creation.
    PostCreate(PostCreate),
    /// Comment creation.
    CommentCreate(CommentCreate),
    /// Vote.
    Vote(VoteCast),
    /// Moderation.
    Moderate(Moderate),
    /// Profile update.
    ProfileUpdate(ProfileUpdate),
}

impl Payload {
    /// Returns the message kind of this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::CellCreate(_) => MessageKind::CellCreate,
            Payload::PostCreate(_) => MessageKind::PostCreate,
            Payload::CommentCreate(_) => MessageKind::CommentCreate,
            Payload::Vote(_) => MessageKind::Vote,
            Payload::Moderate(_) => MessageKind::Moderate,
            Payload::ProfileUpdate(_) => MessageKind::ProfileUpdate,
        }
    }

    /// Returns the entity ids this payload refers to.
    pub fn references(&self) -> Vec<ContentHash> {
        match self {
            Payload::CellCreate(_) | Payload::ProfileUpdate(_) => Vec::new(),
            Payload::PostCreate(post) => vec![post.cell_id],
            Payload::CommentCreate(comment) => vec![comment.post_id],
            Payload::Vote(vote) => vec![vote.target_id],
            Payload::Moderate(moderate) => vec![moderate.target.dependency()],
        }
    }

    /// Re-runs the constructor checks on a decoded payload.
    pub fn validate(&self) -> Result<()> {
        match self {
            Payload::CellCreate(cell) => cell.validate(),
            Payload::PostCreate(post) => post.validate(),
            Payload::CommentCreate(comment) => comment.validate(),
            Payload::Vote(_) => Ok(()),
            Payload::Moderate(moderate) => moderate.validate(),
            Payload::ProfileUpdate(profile) => profile.validate(),
        }
    }
}

impl From<CellCreate> for Payload {
    fn from(content: CellCreate) -> Self {
        Payload::CellCreate(content)
    }
}

impl From<PostCreate> for Payload {
    fn from(content: PostCreate) -> Self {
        Payload::PostCreate(content)
    }
}

impl From<CommentCreate> for Payload {
    fn from(content: CommentCreate) -> Self {
        Payload::CommentCreate(content)
    }
}

impl From<VoteCast> for Payload {
    fn from(content: VoteCast) -> Self {
        Payload::Vote(content)
    }
}

impl From<Moderate> for Payload {
    fn from(content: Moderate) -> Self {
        Payload::Moderate(content)
    }
}

impl From<ProfileUpdate> for Payload {
    fn from(content: ProfileUpdate) -> Self {
        Payload::ProfileUpdate(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forum::types::Address;

    fn some_id() -> ContentHash {
        ContentHash::compute(&"cell").unwrap()
    }

    #[test]
    fn test_cell_requires_name() {
        assert!(CellCreate::new("".into(), "desc".into(), None).is_err());
        assert!(CellCreate::new("rust".into(), "desc".into(), None).is_ok());
    }

    #[test]
    fn test_post_size_limits() {
        let too_long = "x".repeat(MAX_POST_CONTENT_SIZE + 1);
        assert!(PostCreate::new(some_id(), "title".into(), too_long).is_err());
        assert!(PostCreate::new(some_id(), "title".into(), "body".into()).is_ok());
    }

    #[test]
    fn test_call_sign_charset() {
        assert!(ProfileUpdate::new(None, Some("good_name-1".into())).is_ok());
        assert!(ProfileUpdate::new(None, Some("bad name".into())).is_err());
    }

    #[test]
    fn test_references() {
        let post = PostCreate::new(some_id(), "t".into(), "c".into()).unwrap();
        assert_eq!(Payload::from(post).references(), vec![some_id()]);

        let user_mod = Moderate::new(
            ModerationTarget::User {
                cell_id: some_id(),
                address: Address::new("0xabc"),
            },
            ModerationAction::Moderate,
            "spam".into(),
        )
        .unwrap();
        assert_eq!(Payload::from(user_mod).references(), vec![some_id()]);

        let cell = CellCreate::new("c".into(), "".into(), None).unwrap();
        assert!(Payload::from(cell).references().is_empty());
    }
}
