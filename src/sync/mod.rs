//! The running client.
//!
//! - [`engine`]: [`SyncContext`], [`SyncEngine`] and [`EngineHandle`]
//! - [`recovery`]: [`GapDetector`], the pending-by-missing-id buffer
//! - [`status`]: [`SyncStatus`] counters for sync and offline indicators

pub mod engine;
pub mod recovery;
pub mod status;

pub use engine::{EngineHandle, SyncContext, SyncEngine};
pub use recovery::{BufferDecision, GapDetector, RecoveryStats};
pub use status::SyncStatus;
