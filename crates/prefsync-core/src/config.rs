//! Sync engine configuration
//!
//! All timings are stored in milliseconds so the struct maps directly onto a
//! TOML file; accessor methods return [`Duration`]s.

use crate::error::ConfigError;
use crate::types::is_valid_key;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period after the last edit of a key before it may be flushed
    pub debounce_ms: u64,
    /// Global batch flush timer
    pub flush_interval_ms: u64,
    /// Delay before the first retry
    pub retry_base_delay_ms: u64,
    /// Upper bound for any retry delay
    pub retry_max_delay_ms: u64,
    /// Retries per entry before the failure is surfaced
    pub max_retries: u32,
    /// Deadline for every backend call
    pub request_timeout_ms: u64,
    /// Deadline for each startup tier
    pub tier_timeout_ms: u64,
    /// First delay of the fallback-mode recovery loop
    pub recovery_base_delay_ms: u64,
    /// Upper bound for recovery delays
    pub recovery_max_delay_ms: u64,
    /// Recovery attempts before giving up
    pub recovery_budget: u32,
    /// Interval between background upgrade attempts
    pub upgrade_interval_ms: u64,
    /// Maximum nesting depth for deep merges
    pub merge_depth_limit: usize,
    /// Key prefix → debounce window
    pub debounce_overrides: BTreeMap<String, u64>,
    /// Reply to received broadcasts with an ack
    pub acknowledge_broadcasts: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            flush_interval_ms: 200,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            max_retries: 3,
            request_timeout_ms: 30_000,
            tier_timeout_ms: 5_000,
            recovery_base_delay_ms: 2_000,
            recovery_max_delay_ms: 60_000,
            recovery_budget: 5,
            upgrade_interval_ms: 5_000,
            merge_depth_limit: 32,
            debounce_overrides: BTreeMap::new(),
            acknowledge_broadcasts: false,
        }
    }
}

impl SyncConfig {
    /// Create config with defaults
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML; missing fields take their defaults
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the document is malformed or fails [`SyncConfig::validate`]
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges and override keys
    ///
    /// # Errors
    /// Returns the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("debounce_ms", self.debounce_ms),
            ("flush_interval_ms", self.flush_interval_ms),
            ("retry_base_delay_ms", self.retry_base_delay_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("tier_timeout_ms", self.tier_timeout_ms),
            ("recovery_base_delay_ms", self.recovery_base_delay_ms),
            ("upgrade_interval_ms", self.upgrade_interval_ms),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::invalid(
                "retry_max_delay_ms",
                "must not be below retry_base_delay_ms",
            ));
        }
        if self.recovery_max_delay_ms < self.recovery_base_delay_ms {
            return Err(ConfigError::invalid(
                "recovery_max_delay_ms",
                "must not be below recovery_base_delay_ms",
            ));
        }
        if let Some(prefix) = self.debounce_overrides.keys().find(|p| !is_valid_key(p)) {
            return Err(ConfigError::invalid(
                "debounce_overrides",
                format!("'{prefix}' is not a usable key prefix"),
            ));
        }
        Ok(())
    }

    /// Set default debounce window
    #[inline]
    #[must_use]
    pub fn with_debounce(mut self, delay: Duration) -> Self {
        self.debounce_ms = millis(delay);
        self
    }

    /// Set flush interval
    #[inline]
    #[must_use]
    pub fn with_flush_interval(mut self, delay: Duration) -> Self {
        self.flush_interval_ms = millis(delay);
        self
    }

    /// Set retry backoff bounds
    #[inline]
    #[must_use]
    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay_ms = millis(base);
        self.retry_max_delay_ms = millis(max);
        self
    }

    /// Set retry limit
    #[inline]
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set backend call deadline
    #[inline]
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = millis(timeout);
        self
    }

    /// Set recovery loop bounds
    #[inline]
    #[must_use]
    pub fn with_recovery(mut self, base: Duration, max: Duration, budget: u32) -> Self {
        self.recovery_base_delay_ms = millis(base);
        self.recovery_max_delay_ms = millis(max);
        self.recovery_budget = budget;
        self
    }

    /// Set background upgrade interval
    #[inline]
    #[must_use]
    pub fn with_upgrade_interval(mut self, interval: Duration) -> Self {
        self.upgrade_interval_ms = millis(interval);
        self
    }

    /// Use a different debounce window for keys starting with `prefix`
    #[must_use]
    pub fn with_debounce_override(mut self, prefix: impl Into<String>, delay: Duration) -> Self {
        self.debounce_overrides.insert(prefix.into(), millis(delay));
        self
    }

    /// Reply to broadcasts with acks
    #[inline]
    #[must_use]
    pub fn with_broadcast_acks(mut self, enabled: bool) -> Self {
        self.acknowledge_broadcasts = enabled;
        self
    }

    /// Debounce window for `key`: longest matching override prefix, else the default
    #[must_use]
    pub fn debounce_for(&self, key: &str) -> Duration {
        self.debounce_overrides
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map_or(self.debounce(), |(_, ms)| Duration::from_millis(*ms))
    }

    /// Retry delay after `attempts` failures: `base * 2^(attempts-1)`, capped
    #[must_use]
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        backoff(
            self.retry_base_delay(),
            self.retry_max_delay(),
            attempts,
        )
    }

    /// Recovery delay before attempt number `attempt` (1-based)
    #[must_use]
    pub fn recovery_delay(&self, attempt: u32) -> Duration {
        backoff(
            Duration::from_millis(self.recovery_base_delay_ms),
            Duration::from_millis(self.recovery_max_delay_ms),
            attempt,
        )
    }

    /// Default debounce window
    #[inline]
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Flush interval
    #[inline]
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// First retry delay
    #[inline]
    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Retry delay cap
    #[inline]
    #[must_use]
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// Backend call deadline
    #[inline]
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Startup tier deadline
    #[inline]
    #[must_use]
    pub fn tier_timeout(&self) -> Duration {
        Duration::from_millis(self.tier_timeout_ms)
    }

    /// Background upgrade interval
    #[inline]
    #[must_use]
    pub fn upgrade_interval(&self) -> Duration {
        Duration::from_millis(self.upgrade_interval_ms)
    }
}

/// Exponential backoff: `base * 2^(attempt-1)` capped at `max`; attempt 0 is immediate
#[must_use]
pub fn backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |d| d.min(max))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
