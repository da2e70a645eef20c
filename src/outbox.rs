//! Durable queue of locally authored messages.
//!
//! ## Entry lifecycle
//!
//! ```text
//! pending ──► sending ──► confirmed (pruned)
//!    ▲           │
//!    │           ├──► failed ──► pending (after backoff)
//!    │           │       └─────► abandoned (retry budget spent, reported)
//!    └───────────┘ connectivity lost
//! ```
//!
//! A timeout and a rejection both consume one attempt. A timed-out entry goes
//! back to pending since its outcome is unknown; a rejected one is failed.
//! Losing connectivity while sending consumes nothing and also returns the
//! entry to pending. An entry is confirmed by a publish ack or by observing its id on
//! the inbound stream, whichever comes first.
//!
//! Each send carries the entry's dispatch sequence. An outcome for an older
//! sequence, such as a failure reported after a reconnect already re-sent the
//! entry, is ignored. A late ack still confirms.
//!
//! Every transition is written through to the `outbox` store.

use crate::config::OutboxConfig;
use crate::error::Result;
use crate::forum::message::SignedMessage;
use crate::forum::types::ContentHash;
use crate::storage::{KeyValueStore, KeyValueStoreExt, StoreName};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Status of one outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Waiting to be sent, or sent with an unknown outcome.
    Pending,
    /// A publish is in flight.
    Sending,
    /// The last attempt failed; waiting for the backoff to elapse.
    Failed,
    /// Acknowledged or observed. Confirmed entries are pruned right away.
    Confirmed,
    /// Retry budget exhausted.
    Abandoned,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Sending => "sending",
            EntryStatus::Failed => "failed",
            EntryStatus::Confirmed => "confirmed",
            EntryStatus::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// One queued message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// The signed message.
    pub message: SignedMessage,
    /// Current status.
    pub status: EntryStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Number of times the entry was handed out for sending.
    pub sequence: u64,
    /// Earliest time of the next send, in milliseconds.
    pub next_retry_at: u64,
    /// When the entry was queued.
    pub queued_at: u64,
    /// Last failure, for reporting.
    pub last_error: Option<String>,
}

impl OutboxEntry {
    /// Returns the message id.
    pub fn id(&self) -> &ContentHash {
        self.message.id()
    }
}

/// A message handed out for publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// The message to publish.
    pub message: SignedMessage,
    /// Dispatch sequence to quote back in [`Outbox::record_outcome`].
    pub sequence: u64,
}

/// Report of an abandoned entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxReport {
    /// The abandoned message.
    pub message: SignedMessage,
    /// Attempts made.
    pub attempts: u32,
    /// Last failure.
    pub last_error: Option<String>,
}

/// Result of a publish attempt as seen by the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Acknowledged by the transport.
    Acked,
    /// Sent without acknowledgement; wait for the echo.
    Unacknowledged,
    /// No answer within the publish timeout.
    TimedOut,
    /// Refused by the transport.
    Failed(String),
    /// Connectivity was lost; outcome unknown.
    Interrupted,
}

/// Exponential backoff with jitter, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
}

impl Backoff {
    /// Creates a backoff policy from config.
    pub fn new(config: &OutboxConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            jitter_ratio: config.jitter_ratio,
        }
    }

    /// Delay before the retry following `attempts` failures, without jitter.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let delay = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max);
        std::cmp::min(delay, self.max)
    }

    /// Delay with random jitter added.
    pub fn jittered_delay_for(&self, attempts: u32) -> Duration {
        let delay = self.delay_for(attempts);
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=self.jitter_ratio);
        delay + delay.mul_f64(jitter)
    }
}

/// Outbox owned by the engine loop.
pub struct Outbox {
    store: Arc<dyn KeyValueStore>,
    config: OutboxConfig,
    backoff: Backoff,
    entries: BTreeMap<ContentHash, OutboxEntry>,
}

impl fmt::Debug for Outbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbox")
            .field("entries", &self.entries.len())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Outbox {
    /// Loads persisted entries.
    ///
    /// Entries that were in flight when the process stopped go back to
    /// pending.
    pub fn open(store: Arc<dyn KeyValueStore>, config: OutboxConfig) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for mut entry in store.scan_values::<OutboxEntry>(StoreName::Outbox)? {
            if entry.status == EntryStatus::Sending {
                entry.status = EntryStatus::Pending;
            }
            entries.insert(*entry.id(), entry);
        }
        if !entries.is_empty() {
            info!(entries = entries.len(), "Restored outbox");
        }
        Ok(Self {
            backoff: Backoff::new(&config),
            store,
            config,
            entries,
        })
    }

    fn persist(&self, entry: &OutboxEntry) -> Result<()> {
        self.store
            .put(StoreName::Outbox, entry.id().as_bytes(), entry)
    }

    fn remove(&mut self, id: &ContentHash) -> Result<Option<OutboxEntry>> {
        self.store.delete(StoreName::Outbox, id.as_bytes())?;
        Ok(self.entries.remove(id))
    }

    /// Queues a message for sending. Re-queueing a known id is a no-op.
    pub fn enqueue(&mut self, message: SignedMessage, now_ms: u64) -> Result<bool> {
        let id = *message.id();
        if self.entries.contains_key(&id) {
            return Ok(false);
        }
        let entry = OutboxEntry {
            message,
            status: EntryStatus::Pending,
            attempts: 0,
            sequence: 0,
            next_retry_at: now_ms,
            queued_at: now_ms,
            last_error: None,
        };
        self.persist(&entry)?;
        debug!(id = %id.short(), "Queued outbound message");
        self.entries.insert(id, entry);
        Ok(true)
    }

    /// Returns failed entries whose backoff has elapsed to pending.
    pub fn retry_failed(&mut self, now_ms: u64) -> Result<usize> {
        let ids: Vec<ContentHash> = self
            .entries
            .values()
            .filter(|entry| entry.status == EntryStatus::Failed && entry.next_retry_at <= now_ms)
            .map(|entry| *entry.id())
            .collect();
        for id in &ids {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.status = EntryStatus::Pending;
                debug!(id = %id.short(), attempts = entry.attempts, "Retrying failed entry");
            }
            if let Some(entry) = self.entries.get(id) {
                self.persist(entry)?;
            }
        }
        Ok(ids.len())
    }

    /// Moves every due entry to sending and hands out their messages.
    ///
    /// Failed entries pass back through pending once their backoff has
    /// elapsed.
    pub fn take_due(&mut self, now_ms: u64) -> Result<Vec<Dispatch>> {
        self.retry_failed(now_ms)?;
        let due: Vec<ContentHash> = self
            .entries
            .values()
            .filter(|entry| entry.status == EntryStatus::Pending && entry.next_retry_at <= now_ms)
            .map(|entry| *entry.id())
            .collect();

        let mut dispatches = Vec::with_capacity(due.len());
        for id in due {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.status = EntryStatus::Sending;
                entry.sequence += 1;
                dispatches.push(Dispatch {
                    message: entry.message.clone(),
                    sequence: entry.sequence,
                });
            }
            if let Some(entry) = self.entries.get(&id) {
                self.persist(entry)?;
            }
        }
        Ok(dispatches)
    }

    /// Records the outcome of the send numbered `sequence`.
    ///
    /// Returns a report if the entry was abandoned.
    pub fn record_outcome(
        &mut self,
        id: &ContentHash,
        sequence: u64,
        outcome: PublishOutcome,
        now_ms: u64,
    ) -> Result<Option<OutboxReport>> {
        let Some(entry) = self.entries.get_mut(id) else {
            // Already confirmed by observation.
            return Ok(None);
        };
        if entry.status == EntryStatus::Abandoned {
            return Ok(None);
        }
        if outcome == PublishOutcome::Acked {
            debug!(id = %id.short(), sequence, "Publish acknowledged");
            self.remove(id)?;
            return Ok(None);
        }
        if entry.status != EntryStatus::Sending || entry.sequence != sequence {
            debug!(
                id = %id.short(),
                sequence,
                current = entry.sequence,
                "Ignoring stale publish outcome"
            );
            return Ok(None);
        }

        match outcome {
            PublishOutcome::Acked => {}
            PublishOutcome::Unacknowledged => {
                // Retried after the backoff unless the echo confirms it first.
                entry.attempts += 1;
                entry.status = EntryStatus::Pending;
                entry.last_error = Some("Awaiting echo".to_string());
                entry.next_retry_at =
                    now_ms + self.backoff.jittered_delay_for(entry.attempts).as_millis() as u64;
            }
            PublishOutcome::TimedOut => {
                entry.attempts += 1;
                entry.status = EntryStatus::Pending;
                entry.last_error = Some("Publish timed out".to_string());
                entry.next_retry_at =
                    now_ms + self.backoff.jittered_delay_for(entry.attempts).as_millis() as u64;
            }
            PublishOutcome::Interrupted => {
                debug!(id = %id.short(), "Publish interrupted by connectivity loss");
                entry.status = EntryStatus::Pending;
                entry.next_retry_at = now_ms;
            }
            PublishOutcome::Failed(reason) => {
                entry.attempts += 1;
                entry.last_error = Some(reason);
                entry.status = EntryStatus::Failed;
                entry.next_retry_at =
                    now_ms + self.backoff.jittered_delay_for(entry.attempts).as_millis() as u64;
            }
        }

        if entry.attempts >= self.config.max_attempts {
            entry.status = EntryStatus::Abandoned;
            warn!(
                id = %id.short(),
                attempts = entry.attempts,
                error = entry.last_error.as_deref().unwrap_or(""),
                "Abandoned outbound message"
            );
            let report = OutboxReport {
                message: entry.message.clone(),
                attempts: entry.attempts,
                last_error: entry.last_error.clone(),
            };
            if let Some(entry) = self.entries.get(id) {
                self.persist(entry)?;
            }
            return Ok(Some(report));
        }

        if let Some(entry) = self.entries.get(id) {
            debug!(
                id = %id.short(),
                status = %entry.status,
                attempts = entry.attempts,
                next_retry_at = entry.next_retry_at,
                "Outbox transition"
            );
            self.persist(entry)?;
        }
        Ok(None)
    }

    /// Confirms an entry whose id was observed on the inbound stream.
    ///
    /// Returns true if an unconfirmed entry matched.
    pub fn observe(&mut self, id: &ContentHash) -> Result<bool> {
        match self.entries.get(id).map(|entry| entry.status) {
            Some(EntryStatus::Abandoned) | None => Ok(false),
            Some(_) => {
                debug!(id = %id.short(), "Outbound message observed inbound");
                self.remove(id)?;
                Ok(true)
            }
        }
    }

    /// Returns every sending entry to pending without charging an attempt.
    pub fn connection_lost(&mut self, now_ms: u64) -> Result<usize> {
        let ids: Vec<ContentHash> = self
            .entries
            .values()
            .filter(|entry| entry.status == EntryStatus::Sending)
            .map(|entry| *entry.id())
            .collect();
        for id in &ids {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.status = EntryStatus::Pending;
                entry.next_retry_at = now_ms;
            }
            if let Some(entry) = self.entries.get(id) {
                self.persist(entry)?;
            }
        }
        Ok(ids.len())
    }

    /// Drops abandoned entries, returning them.
    pub fn take_abandoned(&mut self) -> Result<Vec<OutboxEntry>> {
        let ids: Vec<ContentHash> = self
            .entries
            .values()
            .filter(|entry| entry.status == EntryStatus::Abandoned)
            .map(|entry| *entry.id())
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.remove(&id)? {
                removed.push(entry);
            }
        }
        Ok(removed)
    }

    /// Returns an entry.
    pub fn get(&self, id: &ContentHash) -> Option<&OutboxEntry> {
        self.entries.get(id)
    }

    /// All entries in id order.
    pub fn entries(&self) -> impl Iterator<Item = &OutboxEntry> {
        self.entries.values()
    }

    /// Entries not yet confirmed or abandoned.
    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.status != EntryStatus::Abandoned)
            .count()
    }

    /// Abandoned entries still held.
    pub fn abandoned_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.status == EntryStatus::Abandoned)
            .count()
    }

    /// Earliest pending retry time, for timer scheduling.
    pub fn next_due_at(&self) -> Option<u64> {
        self.entries
            .values()
            .filter(|entry| matches!(entry.status, EntryStatus::Pending | EntryStatus::Failed))
            .map(|entry| entry.next_retry_at)
            .min()
    }

    /// Writes every entry to the store.
    pub fn flush(&self) -> Result<()> {
        for entry in self.entries.values() {
            self.persist(entry)?;
        }
        Ok(())
    }
}
