//! cellsync two-client simulator
//!
//! Runs two engines over one in-memory relay and lets them act on their
//! own while the network misbehaves:
//!
//! - **Alice**: creates the cell, then posts, comments and votes
//! - **Bob**: participates, drops off the relay now and then, and receives
//!   every frame twice
//! - **Eve**: injects forged and unauthorized frames aimed at Bob
//!
//! A fraction of Alice's frames never reach live subscribers, so Bob has to
//! recover them from history. A reporter logs both clients' counters and
//! whether their states agree.
//!
//! ## Usage
//!
//! ```bash
//! # Run until Ctrl+C
//! cellsync-simulator
//!
//! # Run for 30 seconds, with engine debug logs
//! RUST_LOG=cellsync_simulator=info,cellsync=debug cellsync-simulator 30
//! ```

mod malicious;
mod simulation;

use crate::malicious::Attacker;
use crate::simulation::{run_activity, run_faults, run_reporter, BoxError, SimulatedUser};
use cellsync::forum::CellCreate;
use cellsync::SyncConfig;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Share of Alice's frames withheld from live delivery.
const DROP_RATE: f64 = 0.15;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cellsync_simulator=info,cellsync=warn".into()),
        )
        .init();

    let duration = std::env::args()
        .nth(1)
        .map(|arg| arg.parse::<u64>().map(Duration::from_secs))
        .transpose()?;

    info!("===========================================");
    info!("  cellsync Simulator");
    info!("===========================================");
    info!("");

    let relay = cellsync::transport::MemoryRelay::new();
    let mut config = SyncConfig::default();
    config.outbox.base_backoff_ms = 200;
    config.outbox.max_backoff_ms = 5_000;
    config.outbox.tick_interval_ms = 100;
    config.recovery.query_cooldown_ms = 500;
    config.transport.publish_timeout_ms = 2_000;

    info!("Creating simulated users...");
    let alice = SimulatedUser::start("Alice", &relay, config.clone()).await?;
    let bob = SimulatedUser::start("Bob", &relay, config.clone()).await?;
    info!("");

    info!("[Setup] Alice creating cell...");
    let cell = CellCreate::new("General".into(), "Talk about anything".into(), None)?;
    let cell_id = alice.handle().submit(cell.into()).await?;
    let mut alice_state = alice.handle().state();
    alice_state
        .wait_for(|state| state.cell(&cell_id).is_some())
        .await?;
    info!("[Setup] Cell {} created", cell_id.short());

    alice
        .transport()
        .set_drop_predicate(|_| rand::random::<f64>() < DROP_RATE);
    bob.transport().set_duplicate(true);

    let attacker = Attacker::new(
        relay.clone(),
        config.transport.topic_prefix.clone(),
        bob.handle(),
        cell_id,
    )?;

    let tasks = vec![
        tokio::spawn(run_activity(alice.name(), alice.handle(), cell_id, 25)),
        tokio::spawn(run_activity(bob.name(), bob.handle(), cell_id, 15)),
        tokio::spawn(run_faults(bob.name(), bob.transport().clone())),
        tokio::spawn(run_reporter(alice.handle(), bob.handle())),
    ];
    let malicious = tokio::spawn(malicious::run(attacker));

    info!("===========================================");
    info!("  Simulation Running");
    info!("===========================================");
    info!("Press Ctrl+C to stop the simulation.");
    info!("");

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    let mut malicious = malicious;
    tokio::select! {
        result = &mut malicious => {
            if let Err(e) = result {
                warn!("Malicious task ended: {}", e);
            }
        }
        _ = deadline => info!("Simulation time is up"),
        _ = tokio::signal::ctrl_c() => {
            info!("");
            info!("Shutting down simulator...");
        }
    }

    for task in tasks {
        task.abort();
    }
    malicious.abort();

    let alice_state = alice.handle().snapshot();
    let bob_state = bob.handle().snapshot();
    info!(
        "Final: Alice applied {}, Bob applied {}, converged: {}",
        alice_state.applied_count(),
        bob_state.applied_count(),
        alice_state == bob_state
    );

    alice.shutdown().await?;
    bob.shutdown().await?;
    info!("Simulator stopped.");
    Ok(())
}
