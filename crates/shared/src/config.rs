use crate::error::{ConfigError, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Timing, retry and capacity parameters of the network & transport engine.
///
/// Every numeric constant of the lower transport layer lives here so that
/// deployments can tune them without touching the engine.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// TTL used when the caller does not pass one (default: 5)
    pub default_ttl: u8,
    /// Number of transmissions of an acknowledged message before it times out (default: 3)
    pub acknowledged_attempts: u32,
    /// Time to wait for a response after each transmission, in milliseconds (default: 2000)
    pub acknowledged_attempt_timeout_ms: u64,
    /// Delay between consecutive segments of one transaction, in milliseconds (default: 20)
    pub segment_transmission_interval_ms: u64,
    /// Base of the segment transmission timer, in milliseconds (default: 200)
    pub segment_ack_timeout_base_ms: u64,
    /// Per-hop addition to the segment transmission timer, in milliseconds (default: 50)
    pub segment_ack_timeout_per_hop_ms: u64,
    /// Retransmissions of unacknowledged segments to a unicast peer (default: 4)
    pub segment_retransmissions: u32,
    /// Transmissions of a segmented message to a group or virtual address (default: 2)
    pub group_segment_transmissions: u32,
    /// Base of the receiver acknowledgment timer, in milliseconds (default: 150)
    pub ack_timer_base_ms: u64,
    /// Per-hop addition to the acknowledgment timer, in milliseconds (default: 50)
    pub ack_timer_per_hop_ms: u64,
    /// Block acknowledgments sent for an incomplete transaction before abandoning it (default: 3)
    pub max_ack_retries: u32,
    /// Inactivity window after which an incomplete transaction is discarded, in milliseconds
    /// (default: 10000)
    pub incomplete_timeout_ms: u64,
    /// Maximum number of concurrently reassembled inbound transactions (default: 32)
    pub max_incoming_transactions: usize,
    /// Number of completed transactions remembered for re-acknowledgment (default: 64)
    pub completed_transaction_memory: usize,
    /// Maximum number of outstanding acknowledged requests (default: 64)
    pub max_pending_requests: usize,
    /// Allow several identical requests to the same destination at once (default: false)
    pub allow_concurrent_requests: bool,
    /// Maximum number of source addresses in the replay cache (default: 2048)
    pub replay_cache_capacity: usize,
    /// Sequence numbers reserved per persisted checkpoint (default: 256)
    pub sequence_reservation_block: u32,
    /// Interval of the eviction sweep, in milliseconds (default: 1000)
    pub maintenance_interval_ms: u64,
    /// Capacity of the inbound notification channel (default: 256)
    pub notification_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_ttl: 5,
            acknowledged_attempts: 3,
            acknowledged_attempt_timeout_ms: 2000,
            segment_transmission_interval_ms: 20,
            segment_ack_timeout_base_ms: 200,
            segment_ack_timeout_per_hop_ms: 50,
            segment_retransmissions: 4,
            group_segment_transmissions: 2,
            ack_timer_base_ms: 150,
            ack_timer_per_hop_ms: 50,
            max_ack_retries: 3,
            incomplete_timeout_ms: 10_000,
            max_incoming_transactions: 32,
            completed_transaction_memory: 64,
            max_pending_requests: 64,
            allow_concurrent_requests: false,
            replay_cache_capacity: 2048,
            sequence_reservation_block: 256,
            maintenance_interval_ms: 1000,
            notification_capacity: 256,
        }
    }
}

impl TransportConfig {
    /// Load the configuration from `MESH_*` environment variables.
    ///
    /// Missing variables fall back to the defaults; malformed values are an error.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            default_ttl: env_or("MESH_DEFAULT_TTL", defaults.default_ttl)?,
            acknowledged_attempts: env_or(
                "MESH_ACKNOWLEDGED_ATTEMPTS",
                defaults.acknowledged_attempts,
            )?,
            acknowledged_attempt_timeout_ms: env_or(
                "MESH_ACKNOWLEDGED_ATTEMPT_TIMEOUT_MS",
                defaults.acknowledged_attempt_timeout_ms,
            )?,
            segment_transmission_interval_ms: env_or(
                "MESH_SEGMENT_TRANSMISSION_INTERVAL_MS",
                defaults.segment_transmission_interval_ms,
            )?,
            segment_ack_timeout_base_ms: env_or(
                "MESH_SEGMENT_ACK_TIMEOUT_BASE_MS",
                defaults.segment_ack_timeout_base_ms,
            )?,
            segment_ack_timeout_per_hop_ms: env_or(
                "MESH_SEGMENT_ACK_TIMEOUT_PER_HOP_MS",
                defaults.segment_ack_timeout_per_hop_ms,
            )?,
            segment_retransmissions: env_or(
                "MESH_SEGMENT_RETRANSMISSIONS",
                defaults.segment_retransmissions,
            )?,
            group_segment_transmissions: env_or(
                "MESH_GROUP_SEGMENT_TRANSMISSIONS",
                defaults.group_segment_transmissions,
            )?,
            ack_timer_base_ms: env_or("MESH_ACK_TIMER_BASE_MS", defaults.ack_timer_base_ms)?,
            ack_timer_per_hop_ms: env_or(
                "MESH_ACK_TIMER_PER_HOP_MS",
                defaults.ack_timer_per_hop_ms,
            )?,
            max_ack_retries: env_or("MESH_MAX_ACK_RETRIES", defaults.max_ack_retries)?,
            incomplete_timeout_ms: env_or(
                "MESH_INCOMPLETE_TIMEOUT_MS",
                defaults.incomplete_timeout_ms,
            )?,
            max_incoming_transactions: env_or(
                "MESH_MAX_INCOMING_TRANSACTIONS",
                defaults.max_incoming_transactions,
            )?,
            completed_transaction_memory: env_or(
                "MESH_COMPLETED_TRANSACTION_MEMORY",
                defaults.completed_transaction_memory,
            )?,
            max_pending_requests: env_or(
                "MESH_MAX_PENDING_REQUESTS",
                defaults.max_pending_requests,
            )?,
            allow_concurrent_requests: env_or(
                "MESH_ALLOW_CONCURRENT_REQUESTS",
                defaults.allow_concurrent_requests,
            )?,
            replay_cache_capacity: env_or(
                "MESH_REPLAY_CACHE_CAPACITY",
                defaults.replay_cache_capacity,
            )?,
            sequence_reservation_block: env_or(
                "MESH_SEQUENCE_RESERVATION_BLOCK",
                defaults.sequence_reservation_block,
            )?,
            maintenance_interval_ms: env_or(
                "MESH_MAINTENANCE_INTERVAL_MS",
                defaults.maintenance_interval_ms,
            )?,
            notification_capacity: env_or(
                "MESH_NOTIFICATION_CAPACITY",
                defaults.notification_capacity,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from a JSON document; absent fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.default_ttl > 127 || self.default_ttl == 1 {
            return Err(ConfigError::Validation(format!(
                "default_ttl must be 0 or 2..=127, got {}",
                self.default_ttl
            )));
        }
        if self.acknowledged_attempts == 0 {
            return Err(ConfigError::Validation("acknowledged_attempts must be at least 1".into()));
        }
        if self.group_segment_transmissions == 0 {
            return Err(ConfigError::Validation(
                "group_segment_transmissions must be at least 1".into(),
            ));
        }
        if self.max_incoming_transactions == 0
            || self.max_pending_requests == 0
            || self.replay_cache_capacity == 0
            || self.completed_transaction_memory == 0
            || self.notification_capacity == 0
        {
            return Err(ConfigError::Validation("capacities must be non-zero".into()));
        }
        if self.sequence_reservation_block == 0 {
            return Err(ConfigError::Validation(
                "sequence_reservation_block must be non-zero".into(),
            ));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(ConfigError::Validation("maintenance_interval_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn acknowledged_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.acknowledged_attempt_timeout_ms)
    }

    pub fn segment_transmission_interval(&self) -> Duration {
        Duration::from_millis(self.segment_transmission_interval_ms)
    }

    /// Segment transmission timer for a transaction sent with `ttl`.
    pub fn segment_ack_timeout(&self, ttl: u8) -> Duration {
        Duration::from_millis(
            self.segment_ack_timeout_base_ms + self.segment_ack_timeout_per_hop_ms * u64::from(ttl),
        )
    }

    /// Receiver acknowledgment timer for a segment received with `ttl`.
    pub fn ack_timer(&self, ttl: u8) -> Duration {
        Duration::from_millis(self.ack_timer_base_ms + self.ack_timer_per_hop_ms * u64::from(ttl))
    }

    pub fn incomplete_timeout(&self) -> Duration {
        Duration::from_millis(self.incomplete_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TransportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.acknowledged_attempts, 3);
        assert_eq!(config.acknowledged_attempt_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_timers_scale_with_ttl() {
        let config = TransportConfig::default();
        assert_eq!(config.segment_ack_timeout(0), Duration::from_millis(200));
        assert_eq!(config.segment_ack_timeout(4), Duration::from_millis(400));
        assert_eq!(config.ack_timer(2), Duration::from_millis(250));
    }

    #[test]
    fn test_from_json_partial_document() {
        let json = r#"{"acknowledged_attempts": 5, "default_ttl": 10}"#;
        let config = TransportConfig::from_json(json).unwrap();
        assert_eq!(config.acknowledged_attempts, 5);
        assert_eq!(config.default_ttl, 10);
        // Untouched fields keep their defaults
        assert_eq!(config.segment_retransmissions, 4);
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let config = TransportConfig {
            acknowledged_attempts: 0,
            ..TransportConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_ttl_one() {
        let config = TransportConfig {
            default_ttl: 1,
            ..TransportConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_or_rejects_malformed_value() {
        std::env::set_var("MESH_TEST_MALFORMED_VALUE", "not-a-number");
        let result: Result<u32> = env_or("MESH_TEST_MALFORMED_VALUE", 3);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
        std::env::remove_var("MESH_TEST_MALFORMED_VALUE");
    }

    #[test]
    fn test_env_or_uses_default_when_unset() {
        let result: u32 = env_or("MESH_TEST_UNSET_VALUE", 7).unwrap();
        assert_eq!(result, 7);
    }
}
