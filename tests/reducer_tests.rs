//! Convergence tests for the reducer.
//!
//! These tests feed one fixed message set through the reducer in many
//! delivery orders and check that every order ends in the same state. Parents
//! that arrive late are handled the way the engine handles them: the
//! dependent is parked in a `GapDetector` and replayed once the parent is
//! applied.

use cellsync::config::RecoveryConfig;
use cellsync::crypto::KeyPair;
use cellsync::dag::{dependency_order, ContentHash};
use cellsync::forum::{
    ApplyOutcome, CellCreate, CommentCreate, ForumState, ForumStorage, Moderate,
    MessageKind, ModerationAction, ModerationTarget, Payload, PostCreate, ProfileUpdate, RelevanceScorer,
    SignedMessage, TargetKind, VerifiedMessage, VoteCast,
};
use cellsync::identity::{IdentityDirectory, LocalKeyVerifier, MessageVerifier};
use cellsync::storage::MemoryStore;
use cellsync::sync::GapDetector;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::VecDeque;
use std::sync::Arc;

const T0: u64 = 1_750_000_000_000;

/// Signs and verifies an anonymous message.
fn verified(payload: Payload, timestamp: u64, keypair: &KeyPair) -> VerifiedMessage {
    let message =
        SignedMessage::create(payload, timestamp, keypair, None).expect("Failed to sign message");
    MessageVerifier::new(LocalKeyVerifier::registry())
        .verify(message)
        .expect("Failed to verify message")
}

/// Folds messages in the given order, parking dependents of unknown parents.
fn fold_gated(messages: &[VerifiedMessage]) -> ForumState {
    let mut state = ForumState::new();
    let mut gaps = GapDetector::new(RecoveryConfig::default(), "/test");
    let mut queue: VecDeque<VerifiedMessage> = messages.iter().cloned().collect();
    while let Some(message) = queue.pop_front() {
        let id = *message.id();
        if gaps.is_parked(&id) {
            continue;
        }
        match state.apply(&message) {
            ApplyOutcome::MissingDependency(missing) => {
                gaps.park(message, missing, T0);
            }
            ApplyOutcome::Duplicate => {}
            _ => {
                for dependent in gaps.resolve(&id).into_iter().rev() {
                    queue.push_front(dependent);
                }
            }
        }
    }
    assert_eq!(gaps.parked_count(), 0, "every dependent should resolve");
    state
}

struct Scenario {
    messages: Vec<VerifiedMessage>,
    post: ContentHash,
    comment: ContentHash,
    bob: cellsync::forum::Address,
    alice: cellsync::forum::Address,
    cell: ContentHash,
}

/// A cell with a post, a comment, votes, moderation and profiles.
fn scenario() -> Scenario {
    let admin = KeyPair::generate_ed25519().unwrap();
    let alice = KeyPair::generate_ed25519().unwrap();
    let bob = KeyPair::generate_ed25519().unwrap();

    let cell = verified(
        CellCreate::new("rust".into(), "Systems talk".into(), None)
            .unwrap()
            .into(),
        T0,
        &admin,
    );
    let cell_id = *cell.id();
    let post = verified(
        PostCreate::new(cell_id, "Borrowing".into(), "How does it work?".into())
            .unwrap()
            .into(),
        T0 + 10,
        &alice,
    );
    let post_id = *post.id();
    let comment = verified(
        CommentCreate::new(post_id, "Read the book".into()).unwrap().into(),
        T0 + 20,
        &bob,
    );
    let comment_id = *comment.id();
    let bob_address = comment.author().clone();
    let alice_address = post.author().clone();

    let mut messages = vec![
        cell,
        post,
        comment,
        // Bob changes his mind: up, then down.
        verified(VoteCast::new(post_id, TargetKind::Post, true).into(), T0 + 30, &bob),
        verified(VoteCast::new(post_id, TargetKind::Post, false).into(), T0 + 31, &bob),
        verified(VoteCast::new(post_id, TargetKind::Post, true).into(), T0 + 32, &admin),
        verified(
            VoteCast::new(comment_id, TargetKind::Comment, true).into(),
            T0 + 33,
            &alice,
        ),
        // Bob is not the admin.
        verified(
            Moderate::new(
                ModerationTarget::Post(post_id),
                ModerationAction::Moderate,
                "spam".into(),
            )
            .unwrap()
            .into(),
            T0 + 40,
            &bob,
        ),
        verified(
            Moderate::new(
                ModerationTarget::Comment(comment_id),
                ModerationAction::Moderate,
                "rude".into(),
            )
            .unwrap()
            .into(),
            T0 + 41,
            &admin,
        ),
        verified(
            Moderate::new(
                ModerationTarget::User {
                    cell_id,
                    address: alice_address.clone(),
                },
                ModerationAction::Moderate,
                "off topic".into(),
            )
            .unwrap()
            .into(),
            T0 + 42,
            &admin,
        ),
        verified(
            Moderate::new(
                ModerationTarget::User {
                    cell_id,
                    address: alice_address.clone(),
                },
                ModerationAction::Unmoderate,
                "appealed".into(),
            )
            .unwrap()
            .into(),
            T0 + 43,
            &admin,
        ),
        verified(
            ProfileUpdate::new(Some("Alice".into()), None).unwrap().into(),
            T0 + 50,
            &alice,
        ),
        verified(
            ProfileUpdate::new(Some("Alice R.".into()), Some("ar".into()))
                .unwrap()
                .into(),
            T0 + 51,
            &alice,
        ),
    ];
    // Retransmission.
    let duplicate = messages[3].clone();
    messages.push(duplicate);

    Scenario {
        messages,
        post: post_id,
        comment: comment_id,
        bob: bob_address,
        alice: alice_address,
        cell: cell_id,
    }
}

// =============================================================================
// Replay Safety
// =============================================================================

/// Every delivery order folds to the same state.
#[test]
fn test_any_delivery_order_converges() {
    let scenario = scenario();
    let reference = fold_gated(&scenario.messages);

    for seed in 0..64 {
        let mut shuffled = scenario.messages.clone();
        shuffled.shuffle(&mut StdRng::seed_from_u64(seed));
        let state = fold_gated(&shuffled);
        assert_eq!(state, reference, "order from seed {} diverged", seed);
    }

    let mut reversed = scenario.messages.clone();
    reversed.reverse();
    assert_eq!(fold_gated(&reversed), reference);
}

/// A dependency-ordered batch folds without parking anything.
#[test]
fn test_dependency_ordered_batch_needs_no_parking() {
    let scenario = scenario();
    let mut shuffled = scenario.messages.clone();
    shuffled.shuffle(&mut StdRng::seed_from_u64(7));

    let mut state = ForumState::new();
    for message in dependency_order(shuffled) {
        let outcome = state.apply(&message);
        assert!(outcome.is_settled(), "unexpected {:?}", outcome);
    }
    assert_eq!(state, fold_gated(&scenario.messages));
}

/// Applying the same id twice changes state once.
#[test]
fn test_duplicate_changes_state_once() {
    let scenario = scenario();
    let mut state = ForumState::new();
    for message in &scenario.messages[..4] {
        state.apply(message);
    }
    let after_first = state.clone();
    assert_eq!(state.apply(&scenario.messages[3]), ApplyOutcome::Duplicate);
    assert_eq!(state, after_first);
}

// =============================================================================
// Derived State
// =============================================================================

/// Only the latest vote per voter counts.
#[test]
fn test_vote_convergence() {
    let scenario = scenario();
    let state = fold_gated(&scenario.messages);
    let tally = state.tally(&scenario.post);
    assert_eq!(tally.upvotes(), 1);
    assert_eq!(tally.downvotes(), 1);
    assert!(tally.downvoters.contains(&scenario.bob));
    assert!(!state.vote(&scenario.bob, &scenario.post).unwrap().is_upvote);
}

/// Moderation by a non-admin never applies, whatever the order.
#[test]
fn test_unauthorized_moderation_never_applies() {
    let scenario = scenario();
    for seed in 0..32 {
        let mut shuffled = scenario.messages.clone();
        shuffled.shuffle(&mut StdRng::seed_from_u64(seed));
        let state = fold_gated(&shuffled);

        assert!(!state
            .moderation_status(&ModerationTarget::Post(scenario.post))
            .is_moderated());
        assert!(state
            .moderation_status(&ModerationTarget::Comment(scenario.comment))
            .is_moderated());
        assert!(!state.is_user_moderated(&scenario.cell, &scenario.alice));

        let audit: Vec<_> = state.audit_log().collect();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].actor, scenario.bob);
    }
}

/// The latest profile wins.
#[test]
fn test_profile_is_latest() {
    let scenario = scenario();
    let state = fold_gated(&scenario.messages);
    let profile = state.profile(&scenario.alice).expect("profile applied");
    assert_eq!(profile.display_name.as_deref(), Some("Alice R."));
}

/// Identical state and clock yield identical scores.
#[test]
fn test_relevance_is_deterministic() {
    let scenario = scenario();
    let mut shuffled = scenario.messages.clone();
    shuffled.shuffle(&mut StdRng::seed_from_u64(3));
    let a = fold_gated(&scenario.messages);
    let b = fold_gated(&shuffled);

    let scorer = RelevanceScorer::default();
    let directory = IdentityDirectory::new();
    let now = T0 + 86_400_000;
    assert_eq!(
        scorer.score_post(&a, &directory, &scenario.post, now),
        scorer.score_post(&b, &directory, &scenario.post, now)
    );
    assert_eq!(
        scorer.rank_cells(&a, &directory, now),
        scorer.rank_cells(&b, &directory, now)
    );
    assert_eq!(
        scorer.score_comment(&a, &directory, &scenario.comment, now),
        scorer.score_comment(&b, &directory, &scenario.comment, now)
    );

    // Same history without the comment's moderation.
    let unmoderated: Vec<_> = scenario
        .messages
        .iter()
        .filter(|message| {
            message.kind() != MessageKind::Moderate || message.author() == &scenario.bob
        })
        .cloned()
        .collect();
    let c = fold_gated(&unmoderated);
    let penalized = scorer
        .score_comment(&a, &directory, &scenario.comment, now)
        .unwrap();
    let plain = scorer
        .score_comment(&c, &directory, &scenario.comment, now)
        .unwrap();
    assert!(penalized < plain);
}

// =============================================================================
// Persistence
// =============================================================================

/// A checkpointed state reloads equal.
#[test]
fn test_checkpoint_reload_is_equal() {
    let scenario = scenario();
    let state = fold_gated(&scenario.messages);
    let storage = ForumStorage::new(Arc::new(MemoryStore::new()));
    storage.checkpoint(&state).unwrap();
    assert_eq!(storage.load_state().unwrap(), state);
}
