//! Simulated users and their autonomous activity.

use cellsync::dag::ContentHash;
use cellsync::forum::{CommentCreate, PostCreate, TargetKind, VoteCast};
use cellsync::identity::{LocalKeyVerifier, LocalKeyWallet, NoopResolver, WalletKind};
use cellsync::storage::MemoryStore;
use cellsync::sync::{EngineHandle, SyncContext, SyncEngine};
use cellsync::transport::{MemoryRelay, MemoryTransport};
use cellsync::SyncConfig;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One client with its own store, wallet and relay connection.
pub struct SimulatedUser {
    name: &'static str,
    engine: SyncEngine<LocalKeyWallet>,
    transport: Arc<MemoryTransport>,
}

impl SimulatedUser {
    /// Starts an engine and authorizes a delegated key.
    pub async fn start(
        name: &'static str,
        relay: &MemoryRelay,
        config: SyncConfig,
    ) -> Result<Self, BoxError> {
        let transport = Arc::new(relay.connect());
        let wallet = Arc::new(LocalKeyWallet::generate(WalletKind::Ethereum)?);
        let context = SyncContext::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::clone(&transport),
            wallet,
            Arc::new(NoopResolver),
            LocalKeyVerifier::registry(),
        );
        let engine = SyncEngine::start(context).await?;
        let grant = engine.authorize(None).await?;
        info!(
            "  {:<5} - Wallet: {}",
            name,
            grant.wallet_address().short()
        );
        Ok(Self {
            name,
            engine,
            transport,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn handle(&self) -> EngineHandle {
        self.engine.handle()
    }

    pub fn transport(&self) -> &Arc<MemoryTransport> {
        &self.transport
    }

    /// Stops the engine, checkpointing its state.
    pub async fn shutdown(self) -> Result<(), BoxError> {
        self.engine.shutdown().await?;
        Ok(())
    }
}

/// Posts, comments and votes in `cell_id` until the task is cancelled.
///
/// `post_share` is the percentage of actions that start a new post.
pub async fn run_activity(
    name: &'static str,
    handle: EngineHandle,
    cell_id: ContentHash,
    post_share: u8,
) {
    info!("[{}] Starting autonomous activity...", name);
    let mut action_count: u64 = 0;
    loop {
        action_count += 1;
        let posts: Vec<ContentHash> = handle
            .snapshot()
            .posts_in_cell(&cell_id)
            .iter()
            .map(|post| post.id)
            .collect();

        let (action, target, upvote, delay_ms) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(0..100u8),
                posts.choose(&mut rng).copied(),
                rng.gen_bool(0.7),
                rng.gen_range(50..200u64),
            )
        };

        let result = match target {
            Some(post_id) if action >= post_share => {
                if action % 2 == 0 {
                    debug!("[{}] Commenting on {}", name, post_id.short());
                    match CommentCreate::new(post_id, format!("{}'s reply #{}", name, action_count))
                    {
                        Ok(comment) => handle.submit(comment.into()).await,
                        Err(e) => Err(e),
                    }
                } else {
                    debug!("[{}] Voting on {}", name, post_id.short());
                    handle
                        .submit(VoteCast::new(post_id, TargetKind::Post, upvote).into())
                        .await
                }
            }
            _ => {
                let title = format!("{}'s post #{}", name, action_count);
                info!("[{}] Creating post: {}", name, title);
                match PostCreate::new(cell_id, title, "Notes from the field".into()) {
                    Ok(post) => handle.submit(post.into()).await,
                    Err(e) => Err(e),
                }
            }
        };
        if let Err(e) = result {
            warn!("[{}] Action failed: {}", name, e);
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

/// Periodically cuts `user` off the relay and drops some of its frames.
pub async fn run_faults(user_name: &'static str, transport: Arc<MemoryTransport>) {
    loop {
        let (online_ms, offline_ms) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(2_000..5_000u64), rng.gen_range(500..2_000u64))
        };
        tokio::time::sleep(Duration::from_millis(online_ms)).await;

        info!("[Faults] {} goes offline for {} ms", user_name, offline_ms);
        transport.set_connected(false);
        tokio::time::sleep(Duration::from_millis(offline_ms)).await;
        transport.set_connected(true);
        info!("[Faults] {} is back online", user_name);
    }
}

/// Logs both users' counters and whether their states agree.
pub async fn run_reporter(alice: EngineHandle, bob: EngineHandle) {
    let mut interval = tokio::time::interval(Duration::from_secs(2));
    interval.tick().await;
    loop {
        interval.tick().await;
        let alice_status = *alice.status().borrow();
        let bob_status = *bob.status().borrow();
        let (alice_state, bob_state) = (alice.snapshot(), bob.snapshot());
        info!(
            "[Sync] Alice: {} applied, {} pending, {} missing | Bob: {} applied, {} pending, {} missing",
            alice_state.applied_count(),
            alice_status.outbox_pending,
            alice_status.currently_missing,
            bob_state.applied_count(),
            bob_status.outbox_pending,
            bob_status.currently_missing,
        );
        info!(
            "[Sync] Bob recovered {} this session, {} total, {} dropped frames, {} rejected actions",
            bob_status.recovered_session,
            bob_status.total_recovered,
            bob_status.dropped_frames,
            bob_status.rejected_actions,
        );
        if alice_status.is_settled() && bob_status.is_settled() {
            if alice_state == bob_state {
                info!("[Sync] States converged");
            } else {
                debug!("[Sync] Settled but still exchanging");
            }
        }
    }
}
