//! The state reducer.
//!
//! [`ForumState`] folds verified messages into entity tables. It is the only
//! writer of those tables, and every mutation goes through
//! [`ForumState::apply`].
//!
//! ## Replay safety
//!
//! Folding the same message set in any order, with parents applied before
//! dependents, yields an equal state:
//! - every id is applied at most once (`applied` is the dedup set)
//! - votes, moderation records and profiles are last-write-wins on
//!   `(timestamp, message id)`, so the winner does not depend on arrival
//! - the audit log and listing indexes are ordered maps keyed by id or
//!   `(timestamp, id)`, not by arrival
//!
//! A message whose parent is unknown returns
//! [`ApplyOutcome::MissingDependency`] and is not marked applied, so it can
//! be replayed once the parent arrives.

use crate::forum::message::VerifiedMessage;
use crate::forum::payload::{
    CellCreate, CommentCreate, Moderate, Payload, PostCreate, ProfileUpdate, VoteCast,
};
use crate::forum::permissions::{authorize_moderation, Authorization};
use crate::forum::types::{
    Address, ContentHash, ModerationAction, ModerationStatus, ModerationTarget, TargetKind,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// A community. Its creator is the only admin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    /// Message id of the creating message.
    pub id: ContentHash,
    /// Cell name.
    pub name: String,
    /// Cell description.
    pub description: String,
    /// Optional icon reference.
    pub icon: Option<String>,
    /// Creator address, fixed for the life of the cell.
    pub admin: Address,
    /// Creation timestamp.
    pub created_at: u64,
}

/// A post in a cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Message id.
    pub id: ContentHash,
    /// Owning cell.
    pub cell_id: ContentHash,
    /// Author address.
    pub author: Address,
    /// Title.
    pub title: String,
    /// Body.
    pub content: String,
    /// Creation timestamp.
    pub created_at: u64,
}

/// A comment on a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    /// Message id.
    pub id: ContentHash,
    /// Parent post.
    pub post_id: ContentHash,
    /// Author address.
    pub author: Address,
    /// Body.
    pub content: String,
    /// Creation timestamp.
    pub created_at: u64,
}

/// The effective vote of one voter on one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Id of the winning vote message.
    pub message_id: ContentHash,
    /// Voter address.
    pub voter: Address,
    /// Voted entity.
    pub target_id: ContentHash,
    /// Kind of the voted entity.
    pub target_kind: TargetKind,
    /// Direction.
    pub is_upvote: bool,
    /// Timestamp of the winning message.
    pub timestamp: u64,
}

/// The effective moderation record for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationRecord {
    /// Id of the winning moderation message.
    pub message_id: ContentHash,
    /// Moderated target.
    pub target: ModerationTarget,
    /// Moderate or unmoderate.
    pub action: ModerationAction,
    /// The admin who acted.
    pub actor: Address,
    /// Stated reason.
    pub reason: String,
    /// Timestamp of the winning message.
    pub timestamp: u64,
}

impl ModerationRecord {
    /// Converts to the tagged status shown to readers.
    pub fn status(&self) -> ModerationStatus {
        match self.action {
            ModerationAction::Moderate => ModerationStatus::Moderated {
                by: self.actor.clone(),
                reason: self.reason.clone(),
                at: self.timestamp,
            },
            ModerationAction::Unmoderate => ModerationStatus::Active,
        }
    }
}

/// The latest profile of an author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Id of the winning profile message.
    pub message_id: ContentHash,
    /// Author address.
    pub address: Address,
    /// Display name.
    pub display_name: Option<String>,
    /// Call sign.
    pub call_sign: Option<String>,
    /// Timestamp of the winning message.
    pub updated_at: u64,
}

/// A verified moderation message from someone other than the cell admin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Id of the rejected message.
    pub message_id: ContentHash,
    /// Who attempted the action.
    pub actor: Address,
    /// What they tried to moderate.
    pub target: ModerationTarget,
    /// The attempted action.
    pub action: ModerationAction,
    /// The actual admin of the target's cell.
    pub admin: Address,
    /// Message timestamp.
    pub timestamp: u64,
}

/// Up- and down-voters of one target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    /// Addresses whose effective vote is up.
    pub upvoters: BTreeSet<Address>,
    /// Addresses whose effective vote is down.
    pub downvoters: BTreeSet<Address>,
}

impl VoteTally {
    /// Number of upvotes.
    pub fn upvotes(&self) -> usize {
        self.upvoters.len()
    }

    /// Number of downvotes.
    pub fn downvotes(&self) -> usize {
        self.downvoters.len()
    }

    /// Upvotes minus downvotes.
    pub fn net(&self) -> i64 {
        self.upvotes() as i64 - self.downvotes() as i64
    }

    fn set(&mut self, voter: &Address, is_upvote: bool) {
        self.upvoters.remove(voter);
        self.downvoters.remove(voter);
        if is_upvote {
            self.upvoters.insert(voter.clone());
        } else {
            self.downvoters.insert(voter.clone());
        }
    }
}

/// What `apply` did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The message changed state.
    Applied,
    /// The id was already applied; nothing changed.
    Duplicate,
    /// Applied, but an existing record with a later `(timestamp, id)` won.
    Superseded,
    /// Verified but not admissible; recorded as applied, state unchanged
    /// apart from the audit log.
    Rejected(String),
    /// A referenced entity is not known yet; not recorded as applied.
    MissingDependency(ContentHash),
}

impl ApplyOutcome {
    /// Returns true if the id is now in the applied set.
    pub fn is_settled(&self) -> bool {
        !matches!(self, ApplyOutcome::MissingDependency(_))
    }
}

/// Last-write-wins order. For equal timestamps the larger id wins.
fn supersedes(new: (u64, &ContentHash), old: (u64, &ContentHash)) -> bool {
    new > old
}

type ListingIndex = HashMap<ContentHash, BTreeSet<(u64, ContentHash)>>;

/// Derived forum state for one client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForumState {
    applied: HashSet<ContentHash>,
    cells: HashMap<ContentHash, Cell>,
    posts: HashMap<ContentHash, Post>,
    comments: HashMap<ContentHash, Comment>,
    votes: HashMap<(Address, ContentHash), Vote>,
    moderation: HashMap<ModerationTarget, ModerationRecord>,
    profiles: HashMap<Address, Profile>,
    audit_log: BTreeMap<ContentHash, AuditEntry>,

    // ==========================================================================
    // Secondary indexes, rebuilt on insert
    // ==========================================================================
    tallies: HashMap<ContentHash, VoteTally>,
    cell_posts: ListingIndex,
    post_comments: ListingIndex,
}

impl ForumState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one verified message into the state.
    ///
    /// Each distinct id changes state at most once.
    pub fn apply(&mut self, message: &VerifiedMessage) -> ApplyOutcome {
        let id = *message.id();
        if self.applied.contains(&id) {
            return ApplyOutcome::Duplicate;
        }

        let author = message.author();
        let timestamp = message.timestamp();
        let outcome = match message.payload() {
            Payload::CellCreate(cell) => self.apply_cell(id, author, timestamp, cell),
            Payload::PostCreate(post) => self.apply_post(id, author, timestamp, post),
            Payload::CommentCreate(comment) => self.apply_comment(id, author, timestamp, comment),
            Payload::Vote(vote) => self.apply_vote(id, author, timestamp, vote),
            Payload::Moderate(moderate) => self.apply_moderation(id, author, timestamp, moderate),
            Payload::ProfileUpdate(profile) => self.apply_profile(id, author, timestamp, profile),
        };

        if outcome.is_settled() {
            self.applied.insert(id);
        }
        debug!(
            id = %id.short(),
            kind = %message.kind(),
            outcome = ?outcome,
            "Reducer apply"
        );
        outcome
    }

    fn apply_cell(
        &mut self,
        id: ContentHash,
        author: &Address,
        timestamp: u64,
        cell: &CellCreate,
    ) -> ApplyOutcome {
        self.insert_cell(Cell {
            id,
            name: cell.name.clone(),
            description: cell.description.clone(),
            icon: cell.icon.clone(),
            admin: author.clone(),
            created_at: timestamp,
        });
        ApplyOutcome::Applied
    }

    fn apply_post(
        &mut self,
        id: ContentHash,
        author: &Address,
        timestamp: u64,
        post: &PostCreate,
    ) -> ApplyOutcome {
        if !self.cells.contains_key(&post.cell_id) {
            return ApplyOutcome::MissingDependency(post.cell_id);
        }
        self.insert_post(Post {
            id,
            cell_id: post.cell_id,
            author: author.clone(),
            title: post.title.clone(),
            content: post.content.clone(),
            created_at: timestamp,
        });
        ApplyOutcome::Applied
    }

    fn apply_comment(
        &mut self,
        id: ContentHash,
        author: &Address,
        timestamp: u64,
        comment: &CommentCreate,
    ) -> ApplyOutcome {
        if !self.posts.contains_key(&comment.post_id) {
            return ApplyOutcome::MissingDependency(comment.post_id);
        }
        self.insert_comment(Comment {
            id,
            post_id: comment.post_id,
            author: author.clone(),
            content: comment.content.clone(),
            created_at: timestamp,
        });
        ApplyOutcome::Applied
    }

    fn apply_vote(
        &mut self,
        id: ContentHash,
        author: &Address,
        timestamp: u64,
        vote: &VoteCast,
    ) -> ApplyOutcome {
        if !self.has_entity(&vote.target_id) {
            return ApplyOutcome::MissingDependency(vote.target_id);
        }
        if self.target_kind(&vote.target_id) != Some(vote.target_kind) {
            return ApplyOutcome::Rejected(format!(
                "Vote names {} but target {} is not one",
                vote.target_kind,
                vote.target_id.short()
            ));
        }
        let key = (author.clone(), vote.target_id);
        if let Some(existing) = self.votes.get(&key) {
            if !supersedes((timestamp, &id), (existing.timestamp, &existing.message_id)) {
                return ApplyOutcome::Superseded;
            }
        }
        self.insert_vote(Vote {
            message_id: id,
            voter: author.clone(),
            target_id: vote.target_id,
            target_kind: vote.target_kind,
            is_upvote: vote.is_upvote,
            timestamp,
        });
        ApplyOutcome::Applied
    }

    fn apply_moderation(
        &mut self,
        id: ContentHash,
        author: &Address,
        timestamp: u64,
        moderate: &Moderate,
    ) -> ApplyOutcome {
        match authorize_moderation(self, author, &moderate.target) {
            Authorization::Unresolved(missing) => ApplyOutcome::MissingDependency(missing),
            Authorization::Unauthorized { admin, .. } => {
                warn!(
                    id = %id.short(),
                    actor = author.short(),
                    target = %moderate.target,
                    "Rejected moderation from non-admin"
                );
                self.insert_audit(AuditEntry {
                    message_id: id,
                    actor: author.clone(),
                    target: moderate.target.clone(),
                    action: moderate.action,
                    admin,
                    timestamp,
                });
                ApplyOutcome::Rejected(format!(
                    "{} is not the admin of the target's cell",
                    author.short()
                ))
            }
            Authorization::Authorized { .. } => {
                if let Some(existing) = self.moderation.get(&moderate.target) {
                    if !supersedes((timestamp, &id), (existing.timestamp, &existing.message_id)) {
                        return ApplyOutcome::Superseded;
                    }
                }
                self.insert_moderation(ModerationRecord {
                    message_id: id,
                    target: moderate.target.clone(),
                    action: moderate.action,
                    actor: author.clone(),
                    reason: moderate.reason.clone(),
                    timestamp,
                });
                ApplyOutcome::Applied
            }
        }
    }

    fn apply_profile(
        &mut self,
        id: ContentHash,
        author: &Address,
        timestamp: u64,
        profile: &ProfileUpdate,
    ) -> ApplyOutcome {
        if let Some(existing) = self.profiles.get(author) {
            if !supersedes((timestamp, &id), (existing.updated_at, &existing.message_id)) {
                return ApplyOutcome::Superseded;
            }
        }
        self.insert_profile(Profile {
            message_id: id,
            address: author.clone(),
            display_name: profile.display_name.clone(),
            call_sign: profile.call_sign.clone(),
            updated_at: timestamp,
        });
        ApplyOutcome::Applied
    }

    // ==========================================================================
    // Table writes (also used when restoring a checkpoint)
    // ==========================================================================

    pub(crate) fn mark_applied(&mut self, id: ContentHash) {
        self.applied.insert(id);
    }

    pub(crate) fn insert_cell(&mut self, cell: Cell) {
        self.cell_posts.entry(cell.id).or_default();
        self.cells.insert(cell.id, cell);
    }

    pub(crate) fn insert_post(&mut self, post: Post) {
        self.cell_posts
            .entry(post.cell_id)
            .or_default()
            .insert((post.created_at, post.id));
        self.post_comments.entry(post.id).or_default();
        self.posts.insert(post.id, post);
    }

    pub(crate) fn insert_comment(&mut self, comment: Comment) {
        self.post_comments
            .entry(comment.post_id)
            .or_default()
            .insert((comment.created_at, comment.id));
        self.comments.insert(comment.id, comment);
    }

    pub(crate) fn insert_vote(&mut self, vote: Vote) {
        self.tallies
            .entry(vote.target_id)
            .or_default()
            .set(&vote.voter, vote.is_upvote);
        self.votes.insert((vote.voter.clone(), vote.target_id), vote);
    }

    pub(crate) fn insert_moderation(&mut self, record: ModerationRecord) {
        self.moderation.insert(record.target.clone(), record);
    }

    pub(crate) fn insert_profile(&mut self, profile: Profile) {
        self.profiles.insert(profile.address.clone(), profile);
    }

    pub(crate) fn insert_audit(&mut self, entry: AuditEntry) {
        self.audit_log.insert(entry.message_id, entry);
    }

    // ==========================================================================
    // Queries
    // ==========================================================================

    /// Returns true if `id` has been applied (or rejected).
    pub fn is_applied(&self, id: &ContentHash) -> bool {
        self.applied.contains(id)
    }

    /// Number of settled message ids.
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    /// Returns true if a cell, post or comment with this id exists.
    pub fn has_entity(&self, id: &ContentHash) -> bool {
        self.cells.contains_key(id) || self.posts.contains_key(id) || self.comments.contains_key(id)
    }

    /// Returns the vote target kind of an entity, if it is votable.
    pub fn target_kind(&self, id: &ContentHash) -> Option<TargetKind> {
        if self.posts.contains_key(id) {
            Some(TargetKind::Post)
        } else if self.comments.contains_key(id) {
            Some(TargetKind::Comment)
        } else {
            None
        }
    }

    /// Resolves the cell owning a cell, post or comment id.
    pub fn cell_of(&self, id: &ContentHash) -> Option<ContentHash> {
        if self.cells.contains_key(id) {
            return Some(*id);
        }
        if let Some(post) = self.posts.get(id) {
            return Some(post.cell_id);
        }
        let comment = self.comments.get(id)?;
        self.posts.get(&comment.post_id).map(|post| post.cell_id)
    }

    /// Returns a cell.
    pub fn cell(&self, id: &ContentHash) -> Option<&Cell> {
        self.cells.get(id)
    }

    /// Returns a post.
    pub fn post(&self, id: &ContentHash) -> Option<&Post> {
        self.posts.get(id)
    }

    /// Returns a comment.
    pub fn comment(&self, id: &ContentHash) -> Option<&Comment> {
        self.comments.get(id)
    }

    /// All cells by creation time.
    pub fn cells(&self) -> Vec<&Cell> {
        let mut cells: Vec<_> = self.cells.values().collect();
        cells.sort_by_key(|cell| (cell.created_at, cell.id));
        cells
    }

    /// Posts in a cell by creation time.
    pub fn posts_in_cell(&self, cell_id: &ContentHash) -> Vec<&Post> {
        self.cell_posts
            .get(cell_id)
            .map(|ids| ids.iter().filter_map(|(_, id)| self.posts.get(id)).collect())
            .unwrap_or_default()
    }

    /// Comments on a post by creation time.
    pub fn comments_on_post(&self, post_id: &ContentHash) -> Vec<&Comment> {
        self.post_comments
            .get(post_id)
            .map(|ids| ids.iter().filter_map(|(_, id)| self.comments.get(id)).collect())
            .unwrap_or_default()
    }

    /// Number of posts in a cell.
    pub fn post_count(&self, cell_id: &ContentHash) -> usize {
        self.cell_posts.get(cell_id).map_or(0, |ids| ids.len())
    }

    /// Number of comments on a post.
    pub fn comment_count(&self, post_id: &ContentHash) -> usize {
        self.post_comments.get(post_id).map_or(0, |ids| ids.len())
    }

    /// Distinct commenters on a post.
    pub fn commenters(&self, post_id: &ContentHash) -> BTreeSet<&Address> {
        self.comments_on_post(post_id)
            .into_iter()
            .map(|comment| &comment.author)
            .collect()
    }

    /// Vote tally of a post or comment.
    pub fn tally(&self, target_id: &ContentHash) -> VoteTally {
        self.tallies.get(target_id).cloned().unwrap_or_default()
    }

    /// The effective vote of `voter` on `target_id`.
    pub fn vote(&self, voter: &Address, target_id: &ContentHash) -> Option<&Vote> {
        self.votes.get(&(voter.clone(), *target_id))
    }

    /// The effective moderation record of a target.
    pub fn moderation_record(&self, target: &ModerationTarget) -> Option<&ModerationRecord> {
        self.moderation.get(target)
    }

    /// Moderation status of a target.
    pub fn moderation_status(&self, target: &ModerationTarget) -> ModerationStatus {
        self.moderation
            .get(target)
            .map(ModerationRecord::status)
            .unwrap_or_default()
    }

    /// Returns true if `address` is moderated in `cell_id`.
    pub fn is_user_moderated(&self, cell_id: &ContentHash, address: &Address) -> bool {
        self.moderation_status(&ModerationTarget::User {
            cell_id: *cell_id,
            address: address.clone(),
        })
        .is_moderated()
    }

    /// Returns true if a post is moderated directly or through its author.
    pub fn is_post_hidden(&self, post_id: &ContentHash) -> bool {
        let Some(post) = self.posts.get(post_id) else {
            return false;
        };
        self.moderation_status(&ModerationTarget::Post(*post_id))
            .is_moderated()
            || self.is_user_moderated(&post.cell_id, &post.author)
    }

    /// Returns true if a comment is moderated directly or through its author.
    pub fn is_comment_hidden(&self, comment_id: &ContentHash) -> bool {
        let Some(comment) = self.comments.get(comment_id) else {
            return false;
        };
        if self
            .moderation_status(&ModerationTarget::Comment(*comment_id))
            .is_moderated()
        {
            return true;
        }
        self.cell_of(comment_id)
            .is_some_and(|cell_id| self.is_user_moderated(&cell_id, &comment.author))
    }

    /// The latest profile of an author.
    pub fn profile(&self, address: &Address) -> Option<&Profile> {
        self.profiles.get(address)
    }

    /// Rejected moderation attempts, ordered by message id.
    pub fn audit_log(&self) -> impl Iterator<Item = &AuditEntry> {
        self.audit_log.values()
    }

    /// Every address that authored a cell, post, comment, vote or profile.
    pub fn authors(&self) -> BTreeSet<&Address> {
        self.cells
            .values()
            .map(|cell| &cell.admin)
            .chain(self.posts.values().map(|post| &post.author))
            .chain(self.comments.values().map(|comment| &comment.author))
            .chain(self.votes.values().map(|vote| &vote.voter))
            .chain(self.profiles.keys())
            .collect()
    }

    pub(crate) fn applied_ids(&self) -> impl Iterator<Item = &ContentHash> {
        self.applied.iter()
    }

    pub(crate) fn all_posts(&self) -> impl Iterator<Item = &Post> {
        self.posts.values()
    }

    pub(crate) fn all_comments(&self) -> impl Iterator<Item = &Comment> {
        self.comments.values()
    }

    pub(crate) fn all_votes(&self) -> impl Iterator<Item = &Vote> {
        self.votes.values()
    }

    pub(crate) fn all_moderation(&self) -> impl Iterator<Item = &ModerationRecord> {
        self.moderation.values()
    }

    pub(crate) fn all_profiles(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::forum::message::SignedMessage;

    const T0: u64 = 1_750_000_000_000;

    fn verified(payload: Payload, timestamp: u64, keypair: &KeyPair) -> VerifiedMessage {
        let message = SignedMessage::create(payload, timestamp, keypair, None).unwrap();
        let author = message.claimed_author();
        VerifiedMessage::new(message, author)
    }

    fn cell(keypair: &KeyPair) -> VerifiedMessage {
        let payload = CellCreate::new("rust".into(), "systems".into(), None).unwrap();
        verified(payload.into(), T0, keypair)
    }

    fn post(cell_id: ContentHash, keypair: &KeyPair, ts: u64) -> VerifiedMessage {
        let payload = PostCreate::new(cell_id, "hello".into(), "world".into()).unwrap();
        verified(payload.into(), ts, keypair)
    }

    fn vote(target: ContentHash, up: bool, keypair: &KeyPair, ts: u64) -> VerifiedMessage {
        verified(VoteCast::new(target, TargetKind::Post, up).into(), ts, keypair)
    }

    fn moderate(target: ModerationTarget, keypair: &KeyPair, ts: u64) -> VerifiedMessage {
        let payload = Moderate::new(target, ModerationAction::Moderate, "spam".into()).unwrap();
        verified(payload.into(), ts, keypair)
    }

    #[test]
    fn test_duplicate_applies_once() {
        let admin = KeyPair::generate_ed25519().unwrap();
        let cell = cell(&admin);
        let mut state = ForumState::new();
        assert_eq!(state.apply(&cell), ApplyOutcome::Applied);
        let snapshot = state.clone();
        assert_eq!(state.apply(&cell), ApplyOutcome::Duplicate);
        assert_eq!(state, snapshot);
    }

    #[test]
    fn test_post_without_cell_is_not_settled() {
        let admin = KeyPair::generate_ed25519().unwrap();
        let cell = cell(&admin);
        let post = post(*cell.id(), &admin, T0 + 1);

        let mut state = ForumState::new();
        assert_eq!(state.apply(&post), ApplyOutcome::MissingDependency(*cell.id()));
        assert!(!state.is_applied(post.id()));

        state.apply(&cell);
        assert_eq!(state.apply(&post), ApplyOutcome::Applied);
        assert_eq!(state.posts_in_cell(cell.id()).len(), 1);
    }

    #[test]
    fn test_later_vote_wins_in_either_order() {
        let admin = KeyPair::generate_ed25519().unwrap();
        let voter = KeyPair::generate_ed25519().unwrap();
        let cell = cell(&admin);
        let post = post(*cell.id(), &admin, T0 + 1);
        let up = vote(*post.id(), true, &voter, T0 + 10);
        let down = vote(*post.id(), false, &voter, T0 + 20);

        let mut forward = ForumState::new();
        for m in [&cell, &post, &up, &down] {
            forward.apply(m);
        }
        let mut backward = ForumState::new();
        for m in [&cell, &post, &down, &up] {
            backward.apply(m);
        }
        assert_eq!(forward, backward);
        let tally = forward.tally(post.id());
        assert_eq!((tally.upvotes(), tally.downvotes()), (0, 1));
    }

    #[test]
    fn test_vote_tie_broken_by_larger_id() {
        let admin = KeyPair::generate_ed25519().unwrap();
        let voter = KeyPair::generate_ed25519().unwrap();
        let cell = cell(&admin);
        let post = post(*cell.id(), &admin, T0 + 1);
        let up = vote(*post.id(), true, &voter, T0 + 10);
        let down = vote(*post.id(), false, &voter, T0 + 10);
        let winner_is_up = up.id() > down.id();

        let mut state = ForumState::new();
        for m in [&cell, &post, &down, &up] {
            state.apply(m);
        }
        let effective = state.vote(up.author(), post.id()).unwrap();
        assert_eq!(effective.is_upvote, winner_is_up);
    }

    #[test]
    fn test_vote_kind_mismatch_rejected() {
        let admin = KeyPair::generate_ed25519().unwrap();
        let cell = cell(&admin);
        let bad = verified(
            VoteCast::new(*cell.id(), TargetKind::Post, true).into(),
            T0 + 1,
            &admin,
        );
        let mut state = ForumState::new();
        state.apply(&cell);
        assert!(matches!(state.apply(&bad), ApplyOutcome::Rejected(_)));
        assert!(state.is_applied(bad.id()));
    }

    #[test]
    fn test_non_admin_moderation_is_audited() {
        let admin = KeyPair::generate_ed25519().unwrap();
        let intruder = KeyPair::generate_ed25519().unwrap();
        let cell = cell(&admin);
        let post = post(*cell.id(), &admin, T0 + 1);
        let action = moderate(ModerationTarget::Post(*post.id()), &intruder, T0 + 2);

        let mut state = ForumState::new();
        state.apply(&cell);
        state.apply(&post);
        assert!(matches!(state.apply(&action), ApplyOutcome::Rejected(_)));
        assert!(!state.is_post_hidden(post.id()));
        assert_eq!(state.audit_log().count(), 1);
    }

    #[test]
    fn test_admin_moderates_user_in_cell() {
        let admin = KeyPair::generate_ed25519().unwrap();
        let poster = KeyPair::generate_ed25519().unwrap();
        let cell = cell(&admin);
        let post = post(*cell.id(), &poster, T0 + 1);
        let action = moderate(
            ModerationTarget::User {
                cell_id: *cell.id(),
                address: post.author().clone(),
            },
            &admin,
            T0 + 2,
        );

        let mut state = ForumState::new();
        for m in [&cell, &post, &action] {
            assert_eq!(state.apply(m), ApplyOutcome::Applied);
        }
        assert!(state.is_post_hidden(post.id()));
        assert!(state.is_user_moderated(cell.id(), post.author()));
    }

    #[test]
    fn test_moderate_then_unmoderate() {
        let admin = KeyPair::generate_ed25519().unwrap();
        let cell = cell(&admin);
        let post = post(*cell.id(), &admin, T0 + 1);
        let target = ModerationTarget::Post(*post.id());
        let hide = moderate(target.clone(), &admin, T0 + 2);
        let restore = verified(
            Moderate::new(target.clone(), ModerationAction::Unmoderate, "ok".into())
                .unwrap()
                .into(),
            T0 + 3,
            &admin,
        );

        let mut state = ForumState::new();
        for m in [&cell, &post, &restore, &hide] {
            state.apply(m);
        }
        assert_eq!(state.moderation_status(&target), ModerationStatus::Active);
    }

    #[test]
    fn test_profile_lww() {
        let author = KeyPair::generate_ed25519().unwrap();
        let old = verified(
            ProfileUpdate::new(Some("old".into()), None).unwrap().into(),
            T0,
            &author,
        );
        let new = verified(
            ProfileUpdate::new(Some("new".into()), None).unwrap().into(),
            T0 + 1,
            &author,
        );
        let mut state = ForumState::new();
        state.apply(&new);
        assert_eq!(state.apply(&old), ApplyOutcome::Superseded);
        let profile = state.profile(new.author()).unwrap();
        assert_eq!(profile.display_name.as_deref(), Some("new"));
    }

    #[test]
    fn test_comment_resolves_cell() {
        let admin = KeyPair::generate_ed25519().unwrap();
        let cell = cell(&admin);
        let post = post(*cell.id(), &admin, T0 + 1);
        let comment = verified(
            CommentCreate::new(*post.id(), "first".into()).unwrap().into(),
            T0 + 2,
            &admin,
        );
        let mut state = ForumState::new();
        for m in [&cell, &post, &comment] {
            state.apply(m);
        }
        assert_eq!(state.cell_of(comment.id()), Some(*cell.id()));
        assert_eq!(state.comment_count(post.id()), 1);
        assert_eq!(state.commenters(post.id()).len(), 1);
    }
}
