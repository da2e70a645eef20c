//! # cellsync - local-first forum synchronization
//!
//! A synchronization engine for a decentralized discussion forum. Clients
//! hold only a local cache and exchange signed messages over a pub/sub
//! transport that delivers at-least-once, out of order, and sometimes not at
//! all. Every client that sees the same messages derives the same state.
//!
//! ## Components
//!
//! - **Identity & delegation** ([`identity`]): a wallet signs one auth
//!   message that authorizes a fast ephemeral key for a bounded window
//! - **Message codec** ([`forum::message`]): content-addressed, signed
//!   messages with deterministic ids
//! - **Transport gateway** ([`transport`]): verification boundary over the
//!   pub/sub capability
//! - **Outbox** ([`outbox`]): durable queue of local actions with backoff
//! - **Gap recovery** ([`sync::recovery`]): parks messages whose parents are
//!   unknown and pulls the missing history
//! - **Reducer** ([`forum::state`]): idempotent, order-independent folding
//! - **Relevance** ([`forum::relevance`]) and **permissions**
//!   ([`forum::permissions`]): read-only derivations over reducer state
//!
//! ## Cryptographic Algorithms
//!
//! - **Message signatures**: Ed25519 or ML-DSA-87 (NIST FIPS 204)
//! - **Hashing**: SHA3-256 for message ids
//!
//! ## Examples
//!
//! ### Two clients over an in-memory relay
//!
//! ```rust,no_run
//! use cellsync::forum::CellCreate;
//! use cellsync::identity::{LocalKeyVerifier, LocalKeyWallet, NoopResolver, WalletKind};
//! use cellsync::storage::MemoryStore;
//! use cellsync::sync::{SyncContext, SyncEngine};
//! use cellsync::transport::MemoryRelay;
//! use cellsync::SyncConfig;
//! use std::sync::Arc;
//! # async fn run() -> cellsync::Result<()> {
//! let relay = MemoryRelay::new();
//! let context = SyncContext::new(
//!     SyncConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(relay.connect()),
//!     Arc::new(LocalKeyWallet::generate(WalletKind::Ethereum)?),
//!     Arc::new(NoopResolver),
//!     LocalKeyVerifier::registry(),
//! );
//! let engine = SyncEngine::start(context).await?;
//! engine.authorize(None).await?;
//!
//! let cell = CellCreate::new("rust".into(), "All things Rust".into(), None)?;
//! let cell_id = engine.handle().submit(cell.into()).await?;
//! println!("queued cell {}", cell_id.short());
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod dag;
pub mod error;
pub mod forum;
pub mod identity;
pub mod outbox;
pub mod storage;
pub mod sync;
pub mod transport;

pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use sync::{EngineHandle, SyncContext, SyncEngine, SyncStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
