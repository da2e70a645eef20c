//! Observable sync indicators.

use crate::sync::recovery::RecoveryStats;
use serde::{Deserialize, Serialize};

/// Snapshot of the engine's sync counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Referenced ids not yet known locally.
    pub currently_missing: usize,
    /// Messages parked until a missing id arrives.
    pub parked_dependents: usize,
    /// Missing ids recovered since the last reconnect.
    pub recovered_session: u64,
    /// Missing ids ever detected.
    pub total_missing: u64,
    /// Missing ids ever recovered.
    pub total_recovered: u64,
    /// Missing ids given up on after the recovery horizon.
    pub permanently_missing: u64,
    /// Inbound frames that failed decoding, validation or verification.
    pub dropped_frames: u64,
    /// Verified messages the reducer refused, such as unauthorized moderation.
    pub rejected_actions: u64,
    /// Local messages not yet confirmed.
    pub outbox_pending: usize,
    /// Local messages whose retry budget ran out.
    pub outbox_abandoned: usize,
    /// Transport connectivity.
    pub network_connected: bool,
}

impl SyncStatus {
    pub(crate) fn with_recovery(mut self, stats: RecoveryStats) -> Self {
        self.currently_missing = stats.currently_missing;
        self.parked_dependents = stats.parked_dependents;
        self.recovered_session = stats.recovered_session;
        self.total_missing = stats.total_missing;
        self.total_recovered = stats.total_recovered;
        self.permanently_missing = stats.permanently_missing;
        self
    }

    /// True when connected with nothing missing and nothing left to send.
    pub fn is_settled(&self) -> bool {
        self.network_connected && self.currently_missing == 0 && self.outbox_pending == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settled() {
        let mut status = SyncStatus {
            network_connected: true,
            ..SyncStatus::default()
        };
        assert!(status.is_settled());

        status = status.with_recovery(RecoveryStats {
            currently_missing: 2,
            total_missing: 2,
            ..RecoveryStats::default()
        });
        assert!(!status.is_settled());
        assert_eq!(status.total_missing, 2);
    }
}
