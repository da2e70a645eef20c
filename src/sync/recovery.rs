//! Gap detection and history recovery.
//!
//! A message whose parent is unknown is parked here, keyed by the missing
//! id, instead of being dropped. The detector decides when to ask the
//! transport for history:
//!
//! - one query per missing id at a time
//! - no repeat for the same id within the cooldown window
//! - at most `max_in_flight_queries` queries across all ids; the rest wait
//!   for a slot, oldest gap first
//! - the query window starts `lookback_ms` before the dependent's own
//!   timestamp and ends at the clock skew bound past `now`
//!
//! When the missing entity is applied, its dependents come back out in
//! arrival order. A missing id that stays unresolved past the recovery
//! horizon is given up on and counted as permanently missing.

use crate::config::RecoveryConfig;
use crate::forum::constants::MAX_CLOCK_SKEW_MS;
use crate::forum::message::VerifiedMessage;
use crate::forum::types::{ContentHash, MessageKind};
use crate::transport::{topic_for, HistoryFilter};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Recovery counters exposed to observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    /// Missing ids with buffered dependents right now.
    pub currently_missing: usize,
    /// Dependents buffered right now.
    pub parked_dependents: usize,
    /// Missing ids resolved since the current connection session began.
    pub recovered_session: u64,
    /// Missing ids ever detected.
    pub total_missing: u64,
    /// Missing ids ever resolved.
    pub total_recovered: u64,
    /// Missing ids given up on.
    pub permanently_missing: u64,
}

/// What the detector did with a dependent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferDecision {
    /// Parked; issue this history query.
    Query(HistoryFilter),
    /// Parked; a query for the missing id is in flight, cooling down or
    /// waiting for a free slot.
    Coalesced,
    /// The dependent was already parked.
    Duplicate,
}

#[derive(Debug, Clone)]
struct Buffered {
    arrival: u64,
    message: VerifiedMessage,
}

#[derive(Debug, Clone)]
struct Gap {
    first_seen_at: u64,
    earliest_timestamp: u64,
    last_query_at: Option<u64>,
    in_flight: bool,
    dependents: Vec<Buffered>,
}

/// Pending-by-missing-id buffer.
#[derive(Debug)]
pub struct GapDetector {
    config: RecoveryConfig,
    topics: Vec<String>,
    gaps: HashMap<ContentHash, Gap>,
    parked: HashSet<ContentHash>,
    in_flight: usize,
    next_arrival: u64,
    stats: RecoveryStats,
}

impl GapDetector {
    /// Creates an empty detector querying the parent topics under
    /// `topic_prefix`.
    pub fn new(config: RecoveryConfig, topic_prefix: &str) -> Self {
        let topics = [
            MessageKind::CellCreate,
            MessageKind::PostCreate,
            MessageKind::CommentCreate,
        ]
        .into_iter()
        .map(|kind| topic_for(topic_prefix, kind))
        .collect();
        Self {
            config,
            topics,
            gaps: HashMap::new(),
            parked: HashSet::new(),
            in_flight: 0,
            next_arrival: 0,
            stats: RecoveryStats::default(),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            currently_missing: self.gaps.len(),
            parked_dependents: self.parked.len(),
            ..self.stats
        }
    }

    /// Starts a new connection session; `recovered_session` restarts at 0.
    pub fn reset_session(&mut self) {
        self.stats.recovered_session = 0;
    }

    /// Returns true if `id` is referenced but unknown.
    pub fn is_missing(&self, id: &ContentHash) -> bool {
        self.gaps.contains_key(id)
    }

    /// Returns true if the message `id` is parked.
    pub fn is_parked(&self, id: &ContentHash) -> bool {
        self.parked.contains(id)
    }

    /// Dependents parked across all gaps.
    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Recovery queries currently in flight.
    pub fn in_flight_queries(&self) -> usize {
        self.in_flight
    }

    /// Parks `message` until `missing` is applied.
    pub fn park(
        &mut self,
        message: VerifiedMessage,
        missing: ContentHash,
        now_ms: u64,
    ) -> BufferDecision {
        let id = *message.id();
        if !self.parked.insert(id) {
            return BufferDecision::Duplicate;
        }

        let arrival = self.next_arrival;
        self.next_arrival += 1;
        let timestamp = message.timestamp();

        let gap = self.gaps.entry(missing).or_insert_with(|| {
            self.stats.total_missing += 1;
            Gap {
                first_seen_at: now_ms,
                earliest_timestamp: timestamp,
                last_query_at: None,
                in_flight: false,
                dependents: Vec::new(),
            }
        });
        gap.earliest_timestamp = gap.earliest_timestamp.min(timestamp);
        gap.dependents.push(Buffered { arrival, message });
        debug!(
            id = %id.short(),
            missing = %missing.short(),
            dependents = gap.dependents.len(),
            "Parked dependent of unknown entity"
        );

        let decision = match self.start_query(&missing, now_ms) {
            Some(filter) => BufferDecision::Query(filter),
            None => BufferDecision::Coalesced,
        };
        self.enforce_capacity();
        decision
    }

    fn start_query(&mut self, missing: &ContentHash, now_ms: u64) -> Option<HistoryFilter> {
        let cooldown = self.config.query_cooldown_ms;
        let lookback = self.config.lookback_ms;
        let slots_full = self.in_flight >= self.config.max_in_flight_queries;
        let gap = self.gaps.get_mut(missing)?;
        let cooling = gap
            .last_query_at
            .is_some_and(|at| now_ms.saturating_sub(at) < cooldown);
        if gap.in_flight || cooling {
            return None;
        }
        if slots_full {
            debug!(missing = %missing.short(), "Recovery query deferred, no free slot");
            return None;
        }
        gap.in_flight = true;
        self.in_flight += 1;
        gap.last_query_at = Some(now_ms);
        Some(HistoryFilter {
            topics: self.topics.clone(),
            start_ms: gap.earliest_timestamp.saturating_sub(lookback),
            end_ms: now_ms.saturating_add(MAX_CLOCK_SKEW_MS),
        })
    }

    /// Marks the query for `missing` as finished, whatever its outcome.
    pub fn query_finished(&mut self, missing: &ContentHash) {
        if let Some(gap) = self.gaps.get_mut(missing) {
            if gap.in_flight {
                gap.in_flight = false;
                self.in_flight = self.in_flight.saturating_sub(1);
            }
        }
    }

    /// Queries to issue for gaps whose cooldown has elapsed, oldest gap
    /// first, up to the free query slots.
    pub fn due_queries(&mut self, now_ms: u64) -> Vec<(ContentHash, HistoryFilter)> {
        let mut ids: Vec<(u64, ContentHash)> = self
            .gaps
            .iter()
            .map(|(id, gap)| (gap.first_seen_at, *id))
            .collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|(_, id)| self.start_query(&id, now_ms).map(|filter| (id, filter)))
            .collect()
    }

    fn forget(&mut self, gap: &Gap) {
        if gap.in_flight {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
        for buffered in &gap.dependents {
            self.parked.remove(buffered.message.id());
        }
    }

    /// Releases the dependents of `id` now that it is known, in arrival order.
    pub fn resolve(&mut self, id: &ContentHash) -> Vec<VerifiedMessage> {
        let Some(mut gap) = self.gaps.remove(id) else {
            return Vec::new();
        };
        self.forget(&gap);
        self.stats.recovered_session += 1;
        self.stats.total_recovered += 1;
        gap.dependents.sort_by_key(|buffered| buffered.arrival);
        info!(
            id = %id.short(),
            dependents = gap.dependents.len(),
            "Recovered missing entity"
        );
        gap.dependents
            .into_iter()
            .map(|buffered| buffered.message)
            .collect()
    }

    /// Gives up on gaps older than the recovery horizon.
    ///
    /// Returns the ids given up on.
    pub fn expire(&mut self, now_ms: u64) -> Vec<ContentHash> {
        let horizon = self.config.recovery_horizon_ms;
        let mut expired: Vec<ContentHash> = self
            .gaps
            .iter()
            .filter(|(_, gap)| now_ms.saturating_sub(gap.first_seen_at) >= horizon)
            .map(|(id, _)| *id)
            .collect();
        expired.sort();
        for id in &expired {
            self.drop_gap(id, "recovery horizon elapsed");
        }
        expired
    }

    fn enforce_capacity(&mut self) {
        while self.parked.len() > self.config.max_pending {
            let oldest = self
                .gaps
                .iter()
                .min_by_key(|(id, gap)| (gap.first_seen_at, **id))
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => self.drop_gap(&id, "pending buffer full"),
                None => break,
            }
        }
    }

    fn drop_gap(&mut self, id: &ContentHash, reason: &str) {
        if let Some(gap) = self.gaps.remove(id) {
            self.forget(&gap);
            self.stats.permanently_missing += 1;
            warn!(
                id = %id.short(),
                dependents = gap.dependents.len(),
                reason,
                "Giving up on missing entity"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::forum::payload::{CellCreate, PostCreate, VoteCast};
    use crate::forum::types::{Address, TargetKind};
    use crate::forum::SignedMessage;

    const NOW: u64 = 1_750_000_000_000;

    fn config() -> RecoveryConfig {
        RecoveryConfig {
            query_cooldown_ms: 100,
            recovery_horizon_ms: 1_000,
            lookback_ms: 500,
            max_pending: 3,
            query_timeout_ms: 50,
            max_in_flight_queries: 2,
        }
    }

    fn verified(message: SignedMessage) -> VerifiedMessage {
        let author = Address::anonymous(message.signer_public_key());
        VerifiedMessage::new(message, author)
    }

    fn vote(keypair: &KeyPair, target: ContentHash, ts: u64) -> VerifiedMessage {
        let payload = VoteCast::new(target, TargetKind::Post, true);
        verified(SignedMessage::create(payload.into(), ts, keypair, None).unwrap())
    }

    fn missing_post() -> ContentHash {
        let keypair = KeyPair::generate_ed25519().unwrap();
        let cell = CellCreate::new("c".into(), "".into(), None).unwrap();
        let cell = SignedMessage::create(cell.into(), NOW, &keypair, None).unwrap();
        let post = PostCreate::new(*cell.id(), "t".into(), "b".into()).unwrap();
        *SignedMessage::create(post.into(), NOW, &keypair, None)
            .unwrap()
            .id()
    }

    #[test]
    fn test_queries_are_coalesced() {
        let mut detector = GapDetector::new(config(), "/x");
        let keypair = KeyPair::generate_ed25519().unwrap();
        let post = missing_post();

        let first = vote(&keypair, post, NOW - 10);
        let BufferDecision::Query(filter) = detector.park(first.clone(), post, NOW) else {
            panic!("first dependent should query");
        };
        assert_eq!(filter.start_ms, NOW - 10 - 500);
        assert_eq!(filter.end_ms, NOW + MAX_CLOCK_SKEW_MS);
        assert_eq!(filter.topics.len(), 3);

        assert_eq!(detector.park(first, post, NOW), BufferDecision::Duplicate);
        let second = vote(&keypair, post, NOW);
        assert_eq!(detector.park(second, post, NOW + 1), BufferDecision::Coalesced);

        // In flight: no re-query even after the cooldown.
        assert!(detector.due_queries(NOW + 200).is_empty());
        detector.query_finished(&post);
        assert!(detector.due_queries(NOW + 50).is_empty());
        assert_eq!(detector.due_queries(NOW + 200).len(), 1);

        let stats = detector.stats();
        assert_eq!(stats.currently_missing, 1);
        assert_eq!(stats.total_missing, 1);
    }

    #[test]
    fn test_resolve_releases_in_arrival_order() {
        let mut detector = GapDetector::new(config(), "/x");
        let keypair = KeyPair::generate_ed25519().unwrap();
        let post = missing_post();

        // Later timestamp arrives first.
        let late = vote(&keypair, post, NOW + 5);
        let early = vote(&keypair, post, NOW);
        detector.park(late.clone(), post, NOW);
        detector.park(early.clone(), post, NOW);

        let released = detector.resolve(&post);
        assert_eq!(released, vec![late, early]);
        assert!(detector.resolve(&post).is_empty());
        assert_eq!(detector.parked_count(), 0);

        let stats = detector.stats();
        assert_eq!(stats.currently_missing, 0);
        assert_eq!(stats.recovered_session, 1);
        assert_eq!(stats.total_recovered, 1);

        detector.reset_session();
        assert_eq!(detector.stats().recovered_session, 0);
        assert_eq!(detector.stats().total_recovered, 1);
    }

    #[test]
    fn test_horizon_expiry_counts_permanently_missing() {
        let mut detector = GapDetector::new(config(), "/x");
        let keypair = KeyPair::generate_ed25519().unwrap();
        let post = missing_post();
        let dependent = vote(&keypair, post, NOW);
        let dependent_id = *dependent.id();
        detector.park(dependent, post, NOW);

        assert!(detector.expire(NOW + 999).is_empty());
        assert_eq!(detector.expire(NOW + 1_000), vec![post]);
        assert!(!detector.is_parked(&dependent_id));
        assert!(!detector.is_missing(&post));
        assert_eq!(detector.stats().permanently_missing, 1);
    }

    #[test]
    fn test_capacity_drops_oldest_gap() {
        let mut detector = GapDetector::new(config(), "/x");
        let keypair = KeyPair::generate_ed25519().unwrap();
        let old = missing_post();
        let new = missing_post();

        detector.park(vote(&keypair, old, NOW), old, NOW);
        detector.park(vote(&keypair, old, NOW + 1), old, NOW);
        detector.park(vote(&keypair, new, NOW + 2), new, NOW + 10);
        assert!(detector.is_missing(&old));

        detector.park(vote(&keypair, new, NOW + 3), new, NOW + 20);
        assert!(!detector.is_missing(&old));
        assert!(detector.is_missing(&new));
        assert_eq!(detector.parked_count(), 2);
        assert_eq!(detector.stats().permanently_missing, 1);
    }

    #[test]
    fn test_query_slots_are_bounded() {
        let mut detector = GapDetector::new(config(), "/x");
        let keypair = KeyPair::generate_ed25519().unwrap();
        let first = missing_post();
        let second = missing_post();
        let third = missing_post();

        assert!(matches!(
            detector.park(vote(&keypair, first, NOW), first, NOW),
            BufferDecision::Query(_)
        ));
        assert!(matches!(
            detector.park(vote(&keypair, second, NOW), second, NOW + 1),
            BufferDecision::Query(_)
        ));
        // Both slots taken.
        assert_eq!(
            detector.park(vote(&keypair, third, NOW), third, NOW + 2),
            BufferDecision::Coalesced
        );
        assert_eq!(detector.in_flight_queries(), 2);
        assert!(detector.due_queries(NOW + 500).is_empty());

        // A finished query frees a slot; `first` is still cooling down, so
        // the waiting gap takes it.
        detector.query_finished(&first);
        let due = detector.due_queries(NOW + 50);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, third);

        // Resolving a gap with a query in flight frees its slot too.
        detector.resolve(&second);
        assert_eq!(detector.in_flight_queries(), 1);
        let due = detector.due_queries(NOW + 500);
        assert_eq!(due.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![first]);
        assert_eq!(detector.in_flight_queries(), 2);
    }

    #[test]
    fn test_evicted_gap_releases_its_slot() {
        let mut detector = GapDetector::new(config(), "/x");
        let keypair = KeyPair::generate_ed25519().unwrap();
        let old = missing_post();
        let new = missing_post();

        detector.park(vote(&keypair, old, NOW), old, NOW);
        detector.park(vote(&keypair, old, NOW + 1), old, NOW);
        detector.park(vote(&keypair, old, NOW + 2), old, NOW);
        assert_eq!(detector.in_flight_queries(), 1);
        detector.park(vote(&keypair, new, NOW + 3), new, NOW + 10);

        assert!(!detector.is_missing(&old));
        assert_eq!(detector.in_flight_queries(), 1);
        assert_eq!(detector.parked_count(), 1);
    }
}
