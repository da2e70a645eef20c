//! Message-level adapter over a [`Transport`].
//!
//! Inbound frames are decoded, checked and verified here. A frame that
//! fails any step is dropped and counted; nothing downstream ever sees it.
//! Verification is CPU-bound and runs on the blocking pool, one chunk per
//! core, while output order follows input order.

use crate::config::TransportConfig;
use crate::dag::current_timestamp_millis;
use crate::error::{Result, SyncError};
use crate::forum::constants::MAX_HISTORY_BATCH_SIZE;
use crate::forum::message::{SignedMessage, VerifiedMessage};
use crate::forum::types::MessageKind;
use crate::forum::validation::validate_message;
use crate::identity::MessageVerifier;
use crate::transport::{all_topics, topic_for, Frame, HistoryFilter, PublishAck, Transport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Verifying gateway over a transport.
pub struct TransportGateway<T> {
    transport: Arc<T>,
    verifier: Arc<MessageVerifier>,
    config: TransportConfig,
    dropped: AtomicU64,
}

impl<T> std::fmt::Debug for TransportGateway<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportGateway")
            .field("topic_prefix", &self.config.topic_prefix)
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Transport> TransportGateway<T> {
    /// Creates a gateway.
    pub fn new(transport: Arc<T>, verifier: Arc<MessageVerifier>, config: TransportConfig) -> Self {
        Self {
            transport,
            verifier,
            config,
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns the wrapped transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Content topic of a message kind.
    pub fn topic(&self, kind: MessageKind) -> String {
        topic_for(&self.config.topic_prefix, kind)
    }

    /// Every content topic.
    pub fn topics(&self) -> Vec<String> {
        all_topics(&self.config.topic_prefix)
    }

    /// Frames dropped so far.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Publishes a message, bounded by the configured timeout.
    ///
    /// # Errors
    /// - `PublishTimeout` if no answer arrives in time
    /// - `Transport` if the transport refuses the frame
    pub async fn publish(&self, message: &SignedMessage) -> Result<PublishAck> {
        let frame = Frame {
            topic: self.topic(message.kind()),
            payload: message.to_frame()?,
        };
        let timeout_ms = self.config.publish_timeout_ms;
        tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.transport.publish(frame),
        )
        .await
        .map_err(|_| SyncError::PublishTimeout(timeout_ms))?
    }

    /// Opens an inbound frame stream.
    pub fn subscribe(&self) -> mpsc::Receiver<Frame> {
        self.transport.subscribe()
    }

    /// Observes connectivity.
    pub fn connection(&self) -> watch::Receiver<bool> {
        self.transport.connection()
    }

    /// Current connectivity.
    pub fn is_connected(&self) -> bool {
        let connection = self.transport.connection();
        let connected = *connection.borrow();
        connected
    }

    /// Fetches stored frames, at most `MAX_HISTORY_BATCH_SIZE` of them.
    pub async fn query_history(&self, filter: HistoryFilter) -> Result<Vec<Frame>> {
        let mut frames = self.transport.query_history(filter).await?;
        if frames.len() > MAX_HISTORY_BATCH_SIZE {
            warn!(
                received = frames.len(),
                kept = MAX_HISTORY_BATCH_SIZE,
                "History batch over limit, truncating"
            );
            frames.truncate(MAX_HISTORY_BATCH_SIZE);
        }
        Ok(frames)
    }

    /// Decodes, checks and verifies one frame.
    ///
    /// Failures are counted as dropped frames.
    pub fn accept(&self, frame: &Frame, now_ms: u64) -> Result<VerifiedMessage> {
        let result = self.check(frame, now_ms);
        if let Err(e) = &result {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(topic = %frame.topic, bytes = frame.payload.len(), "Dropped frame: {}", e);
        }
        result
    }

    fn check(&self, frame: &Frame, now_ms: u64) -> Result<VerifiedMessage> {
        let message = SignedMessage::from_frame(&frame.payload)?;
        let expected = self.topic(message.kind());
        if frame.topic != expected {
            return Err(SyncError::validation(format!(
                "{} message arrived on {}",
                message.kind(),
                frame.topic
            )));
        }
        let validation = validate_message(&message, now_ms);
        if !validation.is_valid {
            return Err(SyncError::validation(validation.summary()));
        }
        self.verifier.verify(message)
    }
}

impl<T: Transport> TransportGateway<T> {
    /// Verifies a batch of frames in parallel, keeping input order.
    ///
    /// Frames that fail are dropped and counted.
    pub async fn accept_batch(self: &Arc<Self>, frames: Vec<Frame>) -> Vec<VerifiedMessage> {
        if frames.is_empty() {
            return Vec::new();
        }
        let now_ms = current_timestamp_millis();
        let chunk_size = frames.len().div_ceil(num_cpus::get().max(1));

        let mut remaining = frames;
        let mut handles = Vec::new();
        while !remaining.is_empty() {
            let rest = remaining.split_off(chunk_size.min(remaining.len()));
            let chunk = std::mem::replace(&mut remaining, rest);
            let gateway = Arc::clone(self);
            handles.push(tokio::task::spawn_blocking(move || {
                chunk
                    .iter()
                    .filter_map(|frame| gateway.accept(frame, now_ms).ok())
                    .collect::<Vec<_>>()
            }));
        }

        let mut verified = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(batch) => verified.extend(batch),
                Err(e) => warn!("Verification task failed: {}", e),
            }
        }
        verified
    }
}
