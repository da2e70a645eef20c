//! Engine configuration.
//!
//! Every field has a default, so a JSON file only needs to name the values it
//! overrides. Durations are stored as integer milliseconds.

use crate::crypto::KeyScheme;
use crate::error::{Result, SyncError};
use crate::forum::constants::TOPIC_VERSION;
use crate::identity::VerificationTier;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Outbox retry behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// First retry delay.
    pub base_backoff_ms: u64,
    /// Cap on the retry delay.
    pub max_backoff_ms: u64,
    /// Fraction of the delay added as random jitter, in `[0, 1]`.
    pub jitter_ratio: f64,
    /// Publish attempts before an entry is abandoned.
    pub max_attempts: u32,
    /// Period of the retry timer.
    pub tick_interval_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            jitter_ratio: 0.2,
            max_attempts: 5,
            tick_interval_ms: 500,
        }
    }
}

/// Gap detection and history recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Minimum spacing between two history queries for the same id.
    pub query_cooldown_ms: u64,
    /// A dependent still unresolved after this long is permanently missing.
    pub recovery_horizon_ms: u64,
    /// How far before the dependent's timestamp a query looks for its parent.
    pub lookback_ms: u64,
    /// Cap on buffered dependents; the oldest are expired first.
    pub max_pending: usize,
    /// Wait for one history query before giving up on it.
    pub query_timeout_ms: u64,
    /// Recovery queries allowed in flight at once; further gaps wait for a
    /// free slot.
    pub max_in_flight_queries: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            query_cooldown_ms: 10_000,
            recovery_horizon_ms: 5 * 60 * 1000,
            lookback_ms: 7 * 24 * 60 * 60 * 1000,
            max_pending: 10_000,
            query_timeout_ms: 15_000,
            max_in_flight_queries: 16,
        }
    }
}

/// Delegated signing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    /// Grant lifetime used when the caller does not pick one.
    pub default_duration_ms: u64,
    /// Wait for the wallet to sign the authorization message.
    pub wallet_sign_timeout_ms: u64,
    /// Scheme of generated ephemeral keys.
    pub key_scheme: KeyScheme,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            default_duration_ms: 7 * 24 * 60 * 60 * 1000,
            wallet_sign_timeout_ms: 60_000,
            key_scheme: KeyScheme::Ed25519,
        }
    }
}

/// Transport adapter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Wait for a publish acknowledgement.
    pub publish_timeout_ms: u64,
    /// Prefix of every content topic.
    pub topic_prefix: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            publish_timeout_ms: 10_000,
            topic_prefix: format!("/cellsync/{}", TOPIC_VERSION),
        }
    }
}

/// Relevance scoring weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelevanceConfig {
    /// Base score of a cell.
    pub cell_base: f64,
    /// Base score of a post.
    pub post_base: f64,
    /// Base score of a comment.
    pub comment_base: f64,
    /// Weight of one upvote.
    pub upvote_weight: f64,
    /// Extra weight of an upvote from a verified voter.
    pub verified_upvote_bonus: f64,
    /// Weight of one comment on a post.
    pub comment_weight: f64,
    /// Extra weight of a comment from a verified commenter.
    pub verified_commenter_bonus: f64,
    /// Weight of one post in a cell.
    pub post_weight: f64,
    /// Multiplier for authors with a connected wallet.
    pub wallet_author_multiplier: f64,
    /// Multiplier for authors with verified ownership.
    pub verified_author_multiplier: f64,
    /// Exponential decay rate per day of age.
    pub decay_rate_per_day: f64,
    /// Multiplier applied to moderated content.
    pub moderation_penalty: f64,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            cell_base: 15.0,
            post_base: 10.0,
            comment_base: 5.0,
            upvote_weight: 1.0,
            verified_upvote_bonus: 0.1,
            comment_weight: 0.5,
            verified_commenter_bonus: 0.05,
            post_weight: 1.0,
            wallet_author_multiplier: 1.1,
            verified_author_multiplier: 1.25,
            decay_rate_per_day: 0.1,
            moderation_penalty: 0.01,
        }
    }
}

/// Local permission gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Minimum tier to create posts and comments.
    pub min_post_tier: VerificationTier,
    /// Minimum tier to create cells.
    pub min_cell_tier: VerificationTier,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            min_post_tier: VerificationTier::Anonymous,
            min_cell_tier: VerificationTier::WalletConnected,
        }
    }
}

/// Persistence cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Checkpoint the reducer after this many applied messages.
    pub checkpoint_every: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            checkpoint_every: 200,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Outbox retry behaviour.
    pub outbox: OutboxConfig,
    /// Gap recovery.
    pub recovery: RecoveryConfig,
    /// Delegated signing.
    pub delegation: DelegationConfig,
    /// Transport adapter.
    pub transport: TransportConfig,
    /// Relevance scoring.
    pub relevance: RelevanceConfig,
    /// Permission gates.
    pub permissions: PermissionConfig,
    /// Persistence.
    pub storage: StorageConfig,
}

impl SyncConfig {
    /// Loads a configuration from a JSON file and validates it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            SyncError::config(format!(
                "Failed to parse {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Short timers for tests and simulations.
    pub fn for_tests() -> Self {
        Self {
            outbox: OutboxConfig {
                base_backoff_ms: 10,
                max_backoff_ms: 40,
                jitter_ratio: 0.0,
                max_attempts: 3,
                tick_interval_ms: 5,
            },
            recovery: RecoveryConfig {
                query_cooldown_ms: 50,
                recovery_horizon_ms: 2_000,
                query_timeout_ms: 200,
                ..RecoveryConfig::default()
            },
            delegation: DelegationConfig {
                wallet_sign_timeout_ms: 200,
                ..DelegationConfig::default()
            },
            transport: TransportConfig {
                publish_timeout_ms: 100,
                ..TransportConfig::default()
            },
            storage: StorageConfig { checkpoint_every: 10 },
            ..Self::default()
        }
    }

    /// Rejects inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.outbox.base_backoff_ms == 0 {
            return Err(SyncError::config("outbox.base_backoff_ms must be positive"));
        }
        if self.outbox.max_backoff_ms < self.outbox.base_backoff_ms {
            return Err(SyncError::config(
                "outbox.max_backoff_ms must be at least outbox.base_backoff_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.outbox.jitter_ratio) {
            return Err(SyncError::config("outbox.jitter_ratio must be within [0, 1]"));
        }
        if self.outbox.max_attempts == 0 {
            return Err(SyncError::config("outbox.max_attempts must be positive"));
        }
        if self.outbox.tick_interval_ms == 0 {
            return Err(SyncError::config("outbox.tick_interval_ms must be positive"));
        }
        if self.recovery.recovery_horizon_ms < self.recovery.query_cooldown_ms {
            return Err(SyncError::config(
                "recovery.recovery_horizon_ms must be at least recovery.query_cooldown_ms",
            ));
        }
        if self.recovery.max_in_flight_queries == 0 {
            return Err(SyncError::config(
                "recovery.max_in_flight_queries must be positive",
            ));
        }
        if self.delegation.default_duration_ms == 0 {
            return Err(SyncError::config(
                "delegation.default_duration_ms must be positive",
            ));
        }
        if self.relevance.decay_rate_per_day < 0.0 {
            return Err(SyncError::config(
                "relevance.decay_rate_per_day must not be negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.relevance.moderation_penalty) {
            return Err(SyncError::config(
                "relevance.moderation_penalty must be within [0, 1]",
            ));
        }
        if self.storage.checkpoint_every == 0 {
            return Err(SyncError::config("storage.checkpoint_every must be positive"));
        }
        Ok(())
    }

    /// Publish acknowledgement wait.
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.publish_timeout_ms)
    }

    /// Wallet signing wait.
    pub fn wallet_sign_timeout(&self) -> Duration {
        Duration::from_millis(self.delegation.wallet_sign_timeout_ms)
    }

    /// History query wait.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery.query_timeout_ms)
    }

    /// Outbox timer period.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.outbox.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SyncConfig::default().validate().is_ok());
        assert!(SyncConfig::for_tests().validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let mut config = SyncConfig::default();
        config.outbox.max_backoff_ms = 10;
        config.outbox.base_backoff_ms = 100;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_default_topic_prefix_carries_version() {
        assert_eq!(
            SyncConfig::default().transport.topic_prefix,
            format!("/cellsync/{}", TOPIC_VERSION)
        );
    }

    #[test]
    fn test_rejects_zero_query_slots() {
        let mut config = SyncConfig::default();
        config.recovery.max_in_flight_queries = 0;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_partial_json_file() {
        let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        write!(
            file,
            r#"{{"outbox": {{"max_attempts": 7}}, "delegation": {{"key_scheme": "MlDsa87"}}}}"#
        )
        .unwrap();

        let config = SyncConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.outbox.max_attempts, 7);
        assert_eq!(config.outbox.base_backoff_ms, 1_000);
        assert_eq!(config.delegation.key_scheme, KeyScheme::MlDsa87);
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        write!(file, "not json").unwrap();
        assert!(matches!(
            SyncConfig::from_json_file(file.path()),
            Err(SyncError::Config(_))
        ));
    }
}
