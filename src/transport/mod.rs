//! Publish/subscribe transport boundary.
//!
//! A [`Transport`] moves opaque frames on content topics. It knows nothing
//! about messages; [`TransportGateway`] adds decoding, verification and the
//! publish timeout on top of it.
//!
//! ## Implementations
//!
//! - `memory`: `MemoryRelay` / `MemoryTransport`, an in-process relay with
//!   knobs for acks, connectivity and frame loss

pub mod gateway;
pub mod memory;

pub use gateway::TransportGateway;
pub use memory::{AckMode, MemoryRelay, MemoryTransport};

use crate::error::Result;
use crate::forum::types::MessageKind;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::{mpsc, watch};

/// A raw frame on a content topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Content topic.
    pub topic: String,
    /// Encoded `SignedMessage`.
    pub payload: Vec<u8>,
}

/// Publish result reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishAck {
    /// The network confirmed receipt.
    Ack,
    /// Sent, but this transport cannot confirm receipt.
    NoAck,
}

/// Historical query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFilter {
    /// Topics to search.
    pub topics: Vec<String>,
    /// Start of the time range, inclusive.
    pub start_ms: u64,
    /// End of the time range, inclusive.
    pub end_ms: u64,
}

impl HistoryFilter {
    /// Returns true if a frame stored at `stored_at` on `topic` matches.
    pub fn matches(&self, topic: &str, stored_at: u64) -> bool {
        self.start_ms <= stored_at
            && stored_at <= self.end_ms
            && self.topics.iter().any(|t| t == topic)
    }
}

/// Builds the content topic of a message kind.
pub fn topic_for(prefix: &str, kind: MessageKind) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), kind.topic_name())
}

/// Every content topic under `prefix`.
pub fn all_topics(prefix: &str) -> Vec<String> {
    MessageKind::ALL
        .iter()
        .map(|&kind| topic_for(prefix, kind))
        .collect()
}

/// External pub/sub capability.
pub trait Transport: Send + Sync + 'static {
    /// Publishes a frame.
    fn publish(&self, frame: Frame) -> impl Future<Output = Result<PublishAck>> + Send;

    /// Opens a new inbound stream. Calling it again after a reconnect
    /// yields a fresh stream; frames are never replayed across streams.
    fn subscribe(&self) -> mpsc::Receiver<Frame>;

    /// Fetches stored frames matching `filter`.
    fn query_history(
        &self,
        filter: HistoryFilter,
    ) -> impl Future<Output = Result<Vec<Frame>>> + Send;

    /// Observes connectivity. `true` means connected.
    fn connection(&self) -> watch::Receiver<bool>;
}
