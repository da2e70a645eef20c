//! Benchmarks for folding messages and scoring the result.

use cellsync::crypto::KeyPair;
use cellsync::dag::{dependency_order, ContentHash};
use cellsync::forum::{
    CellCreate, CommentCreate, ForumState, Payload, PostCreate, RelevanceScorer, SignedMessage,
    TargetKind, VerifiedMessage, VoteCast,
};
use cellsync::identity::{IdentityDirectory, LocalKeyVerifier, MessageVerifier};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

const T0: u64 = 1_750_000_000_000;

fn verified(
    verifier: &MessageVerifier,
    payload: Payload,
    timestamp: u64,
    keypair: &KeyPair,
) -> VerifiedMessage {
    let message = SignedMessage::create(payload, timestamp, keypair, None).unwrap();
    verifier.verify(message).unwrap()
}

/// One cell with `posts` posts, each with a comment and votes from every
/// user.
fn history(posts: usize, users: &[KeyPair]) -> (ContentHash, Vec<VerifiedMessage>) {
    let verifier = MessageVerifier::new(LocalKeyVerifier::registry());
    let admin = &users[0];
    let cell = verified(
        &verifier,
        CellCreate::new("bench".into(), "Benchmarks".into(), None)
            .unwrap()
            .into(),
        T0,
        admin,
    );
    let cell_id = *cell.id();
    let mut messages = vec![cell];
    let mut ts = T0;

    for i in 0..posts {
        ts += 1;
        let author = &users[i % users.len()];
        let post = verified(
            &verifier,
            PostCreate::new(cell_id, format!("Post {}", i), "Body".into())
                .unwrap()
                .into(),
            ts,
            author,
        );
        let post_id = *post.id();
        messages.push(post);
        ts += 1;
        messages.push(verified(
            &verifier,
            CommentCreate::new(post_id, "Reply".into()).unwrap().into(),
            ts,
            &users[(i + 1) % users.len()],
        ));
        for (j, voter) in users.iter().enumerate() {
            ts += 1;
            messages.push(verified(
                &verifier,
                VoteCast::new(post_id, TargetKind::Post, (i + j) % 3 != 0).into(),
                ts,
                voter,
            ));
        }
    }
    (cell_id, messages)
}

fn bench_fold(c: &mut Criterion) {
    let users: Vec<KeyPair> = (0..8).map(|_| KeyPair::generate_ed25519().unwrap()).collect();
    let mut group = c.benchmark_group("fold");

    for posts in [10, 100, 500] {
        let (_, messages) = history(posts, &users);
        let mut shuffled = messages.clone();
        shuffled.shuffle(&mut StdRng::seed_from_u64(42));
        group.throughput(Throughput::Elements(messages.len() as u64));

        group.bench_with_input(BenchmarkId::new("in_order", posts), &messages, |b, messages| {
            b.iter(|| {
                let mut state = ForumState::new();
                for message in messages {
                    state.apply(black_box(message));
                }
                state
            })
        });

        group.bench_with_input(
            BenchmarkId::new("shuffled_then_sorted", posts),
            &shuffled,
            |b, shuffled| {
                b.iter(|| {
                    let mut state = ForumState::new();
                    for message in dependency_order(shuffled.clone()) {
                        state.apply(black_box(&message));
                    }
                    state
                })
            },
        );
    }

    group.finish();
}

fn bench_rank(c: &mut Criterion) {
    let users: Vec<KeyPair> = (0..8).map(|_| KeyPair::generate_ed25519().unwrap()).collect();
    let scorer = RelevanceScorer::default();
    let directory = IdentityDirectory::new();
    let now = T0 + 3 * 86_400_000;
    let mut group = c.benchmark_group("rank_posts");

    for posts in [10, 100, 500] {
        let (cell_id, messages) = history(posts, &users);
        let mut state = ForumState::new();
        for message in &messages {
            state.apply(message);
        }
        group.throughput(Throughput::Elements(posts as u64));
        group.bench_with_input(BenchmarkId::from_parameter(posts), &state, |b, state| {
            b.iter(|| scorer.rank_posts(black_box(state), &directory, &cell_id, now))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fold, bench_rank);
criterion_main!(benches);
