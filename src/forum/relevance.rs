//! Relevance scoring.
//!
//! ```text
//! score = max(0, base + engagement)
//!       × author_multiplier
//!       × exp(-decay_rate × age_days)
//!       × moderation_penalty (if moderated)
//! ```
//!
//! Engagement counts net votes and comments, with a bonus for each voter or
//! commenter who is ownership-verified. Scores are recomputed from reducer
//! state on demand and depend only on the state, the directory and `now_ms`.

use crate::config::RelevanceConfig;
use crate::forum::state::ForumState;
use crate::forum::types::{Address, ContentHash};
use crate::identity::{IdentityDirectory, VerificationTier};
use std::cmp::Ordering;

const MS_PER_DAY: f64 = 86_400_000.0;

/// The terms of one score, for display and testing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    /// Base score of the entity kind.
    pub base: f64,
    /// Votes and comments.
    pub engagement: f64,
    /// Multiplier from the author's tier.
    pub author_multiplier: f64,
    /// Time decay in `(0, 1]`.
    pub decay: f64,
    /// Moderation multiplier, 1 when not moderated.
    pub moderation: f64,
}

impl ScoreBreakdown {
    /// The final score.
    pub fn total(&self) -> f64 {
        (self.base + self.engagement).max(0.0) * self.author_multiplier * self.decay * self.moderation
    }
}

/// Computes relevance scores from reducer state.
#[derive(Debug, Clone, Default)]
pub struct RelevanceScorer {
    config: RelevanceConfig,
}

impl RelevanceScorer {
    /// Creates a scorer with the given weights.
    pub fn new(config: RelevanceConfig) -> Self {
        Self { config }
    }

    fn author_multiplier(&self, directory: &IdentityDirectory, author: &Address) -> f64 {
        match directory.tier(author) {
            VerificationTier::Anonymous => 1.0,
            VerificationTier::WalletConnected => self.config.wallet_author_multiplier,
            VerificationTier::OwnershipVerified => self.config.verified_author_multiplier,
        }
    }

    fn decay(&self, created_at: u64, now_ms: u64) -> f64 {
        let age_days = now_ms.saturating_sub(created_at) as f64 / MS_PER_DAY;
        (-self.config.decay_rate_per_day * age_days).exp()
    }

    fn moderation(&self, hidden: bool) -> f64 {
        if hidden {
            self.config.moderation_penalty
        } else {
            1.0
        }
    }

    fn vote_engagement(
        &self,
        state: &ForumState,
        directory: &IdentityDirectory,
        target: &ContentHash,
    ) -> f64 {
        let tally = state.tally(target);
        let verified_upvoters = tally
            .upvoters
            .iter()
            .filter(|voter| directory.is_verified(voter))
            .count();
        tally.net() as f64 * self.config.upvote_weight
            + verified_upvoters as f64 * self.config.verified_upvote_bonus
    }

    /// Score terms of a post.
    pub fn post_breakdown(
        &self,
        state: &ForumState,
        directory: &IdentityDirectory,
        post_id: &ContentHash,
        now_ms: u64,
    ) -> Option<ScoreBreakdown> {
        let post = state.post(post_id)?;
        let commenters = state.commenters(post_id);
        let verified_commenters = commenters
            .iter()
            .filter(|author| directory.is_verified(author))
            .count();
        let engagement = self.vote_engagement(state, directory, post_id)
            + state.comment_count(post_id) as f64 * self.config.comment_weight
            + verified_commenters as f64 * self.config.verified_commenter_bonus;

        Some(ScoreBreakdown {
            base: self.config.post_base,
            engagement,
            author_multiplier: self.author_multiplier(directory, &post.author),
            decay: self.decay(post.created_at, now_ms),
            moderation: self.moderation(state.is_post_hidden(post_id)),
        })
    }

    /// Score of a post.
    pub fn score_post(
        &self,
        state: &ForumState,
        directory: &IdentityDirectory,
        post_id: &ContentHash,
        now_ms: u64,
    ) -> Option<f64> {
        self.post_breakdown(state, directory, post_id, now_ms)
            .map(|b| b.total())
    }

    /// Score of a comment.
    pub fn score_comment(
        &self,
        state: &ForumState,
        directory: &IdentityDirectory,
        comment_id: &ContentHash,
        now_ms: u64,
    ) -> Option<f64> {
        let comment = state.comment(comment_id)?;
        let breakdown = ScoreBreakdown {
            base: self.config.comment_base,
            engagement: self.vote_engagement(state, directory, comment_id),
            author_multiplier: self.author_multiplier(directory, &comment.author),
            decay: self.decay(comment.created_at, now_ms),
            moderation: self.moderation(state.is_comment_hidden(comment_id)),
        };
        Some(breakdown.total())
    }

    /// Score of a cell.
    ///
    /// Decay runs from the latest activity: the newest post or the creation.
    pub fn score_cell(
        &self,
        state: &ForumState,
        directory: &IdentityDirectory,
        cell_id: &ContentHash,
        now_ms: u64,
    ) -> Option<f64> {
        let cell = state.cell(cell_id)?;
        let posts = state.posts_in_cell(cell_id);
        let comments: usize = posts.iter().map(|p| state.comment_count(&p.id)).sum();
        let last_activity = posts
            .last()
            .map_or(cell.created_at, |p| p.created_at.max(cell.created_at));
        let breakdown = ScoreBreakdown {
            base: self.config.cell_base,
            engagement: posts.len() as f64 * self.config.post_weight
                + comments as f64 * self.config.comment_weight,
            author_multiplier: self.author_multiplier(directory, &cell.admin),
            decay: self.decay(last_activity, now_ms),
            moderation: 1.0,
        };
        Some(breakdown.total())
    }

    /// Posts of a cell, highest score first. Ties sort by id.
    pub fn rank_posts(
        &self,
        state: &ForumState,
        directory: &IdentityDirectory,
        cell_id: &ContentHash,
        now_ms: u64,
    ) -> Vec<(ContentHash, f64)> {
        let scored = state
            .posts_in_cell(cell_id)
            .into_iter()
            .filter_map(|post| {
                self.score_post(state, directory, &post.id, now_ms)
                    .map(|score| (post.id, score))
            })
            .collect();
        sort_ranked(scored)
    }

    /// Comments of a post, highest score first. Ties sort by id.
    pub fn rank_comments(
        &self,
        state: &ForumState,
        directory: &IdentityDirectory,
        post_id: &ContentHash,
        now_ms: u64,
    ) -> Vec<(ContentHash, f64)> {
        let scored = state
            .comments_on_post(post_id)
            .into_iter()
            .filter_map(|comment| {
                self.score_comment(state, directory, &comment.id, now_ms)
                    .map(|score| (comment.id, score))
            })
            .collect();
        sort_ranked(scored)
    }

    /// All cells, highest score first. Ties sort by id.
    pub fn rank_cells(
        &self,
        state: &ForumState,
        directory: &IdentityDirectory,
        now_ms: u64,
    ) -> Vec<(ContentHash, f64)> {
        let scored = state
            .cells()
            .into_iter()
            .filter_map(|cell| {
                self.score_cell(state, directory, &cell.id, now_ms)
                    .map(|score| (cell.id, score))
            })
            .collect();
        sort_ranked(scored)
    }
}

fn sort_ranked(mut scored: Vec<(ContentHash, f64)>) -> Vec<(ContentHash, f64)> {
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::forum::message::{SignedMessage, VerifiedMessage};
    use crate::forum::payload::{CellCreate, Moderate, Payload, PostCreate, VoteCast};
    use crate::forum::types::{ModerationAction, ModerationTarget, TargetKind};

    const T0: u64 = 1_750_000_000_000;
    const DAY: u64 = 86_400_000;

    fn apply(state: &mut ForumState, payload: Payload, ts: u64, keypair: &KeyPair) -> ContentHash {
        let message = SignedMessage::create(payload, ts, keypair, None).unwrap();
        let author = message.claimed_author();
        let verified = VerifiedMessage::new(message, author);
        state.apply(&verified);
        *verified.id()
    }

    fn cell_with_post(admin: &KeyPair) -> (ForumState, ContentHash, ContentHash) {
        let mut state = ForumState::new();
        let cell = apply(
            &mut state,
            CellCreate::new("c".into(), "".into(), None).unwrap().into(),
            T0,
            admin,
        );
        let post = apply(
            &mut state,
            PostCreate::new(cell, "t".into(), "b".into()).unwrap().into(),
            T0,
            admin,
        );
        (state, cell, post)
    }

    #[test]
    fn test_fresh_post_scores_base() {
        let admin = KeyPair::generate_ed25519().unwrap();
        let (state, _, post) = cell_with_post(&admin);
        let scorer = RelevanceScorer::default();
        let score = scorer
            .score_post(&state, &IdentityDirectory::new(), &post, T0)
            .unwrap();
        assert!((score - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_upvotes_raise_and_decay_lowers() {
        let admin = KeyPair::generate_ed25519().unwrap();
        let (mut state, _, post) = cell_with_post(&admin);
        let directory = IdentityDirectory::new();
        let scorer = RelevanceScorer::default();
        let before = scorer.score_post(&state, &directory, &post, T0).unwrap();

        let voter = KeyPair::generate_ed25519().unwrap();
        apply(
            &mut state,
            VoteCast::new(post, TargetKind::Post, true).into(),
            T0 + 1,
            &voter,
        );
        let after = scorer.score_post(&state, &directory, &post, T0).unwrap();
        assert!(after > before);

        let older = scorer.score_post(&state, &directory, &post, T0 + 10 * DAY).unwrap();
        assert!(older < after);
        let expected = 11.0 * (-1.0f64).exp();
        assert!((older - expected).abs() < 1e-9);
    }

    #[test]
    fn test_moderated_post_near_zero() {
        let admin = KeyPair::generate_ed25519().unwrap();
        let (mut state, _, post) = cell_with_post(&admin);
        apply(
            &mut state,
            Moderate::new(
                ModerationTarget::Post(post),
                ModerationAction::Moderate,
                "spam".into(),
            )
            .unwrap()
            .into(),
            T0 + 1,
            &admin,
        );
        let score = RelevanceScorer::default()
            .score_post(&state, &IdentityDirectory::new(), &post, T0)
            .unwrap();
        assert!(score > 0.0 && score < 0.2);
    }

    #[test]
    fn test_deterministic_ranking() {
        let admin = KeyPair::generate_ed25519().unwrap();
        let (mut state, cell, _) = cell_with_post(&admin);
        apply(
            &mut state,
            PostCreate::new(cell, "second".into(), "b".into()).unwrap().into(),
            T0,
            &admin,
        );
        let scorer = RelevanceScorer::default();
        let directory = IdentityDirectory::new();
        let a = scorer.rank_posts(&state, &directory, &cell, T0 + DAY);
        let b = scorer.rank_posts(&state.clone(), &directory, &cell, T0 + DAY);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert!(a[0].0 < a[1].0);
    }
}
