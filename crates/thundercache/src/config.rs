// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Serializable configuration for the cache components.
//!
//! These structs mirror the builder settings in whole seconds and milliseconds so they can be
//! loaded from configuration files. Missing fields take their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`RetryPolicy`][crate::RetryPolicy].
///
/// # Example
///
/// ```
/// use thundercache::RetryConfig;
///
/// let config: RetryConfig = serde_json::from_str(r#"{ "max_attempts": 5 }"#)?;
/// assert_eq!(config.max_attempts, 5);
/// assert_eq!(config.initial_delay_ms, 330);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct RetryConfig {
    /// The total number of attempts, including the first.
    pub max_attempts: u32,
    /// The factor the delay grows by after each attempt.
    pub multiplier: f64,
    /// The delay before the first retry, before jitter.
    pub initial_delay_ms: u64,
    /// The smallest share of the delay added as jitter.
    pub jitter_min: f64,
    /// The largest share of the delay added as jitter.
    pub jitter_max: f64,
    /// The cap on a single delay.
    pub max_delay_ms: u64,
    /// The random spread added to the cap.
    pub max_delay_spread_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 14,
            multiplier: 1.8,
            initial_delay_ms: 330,
            jitter_min: 0.01,
            jitter_max: 0.99,
            max_delay_ms: 25_000,
            max_delay_spread_ms: 500,
        }
    }
}

/// Configuration for a [`LocalCache`][crate::LocalCache].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct LocalCacheConfig {
    /// The nominal freshness of computed values.
    pub max_age_secs: u64,
    /// The share of calls, between 0 and 1, that run an eviction sweep.
    pub sweep_probability: f64,
}

impl LocalCacheConfig {
    /// The nominal freshness as a duration.
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 60,
            sweep_probability: 0.05,
        }
    }
}

/// Configuration for a [`StampedeCache`][crate::StampedeCache].
///
/// Lock timings default to values derived from `critical_secs` when left out.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use thundercache::StampedeConfig;
///
/// let config: StampedeConfig = serde_json::from_str(r#"{ "max_age_secs": 300, "critical_secs": 10 }"#)?;
/// assert_eq!(config.lock_ttl(), Duration::from_secs(31));
/// assert_eq!(config.lock_wait(), Duration::from_secs(30));
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct StampedeConfig {
    /// The nominal freshness of computed values.
    pub max_age_secs: u64,
    /// How long a computation may run before waiters treat it as abandoned.
    pub critical_secs: u64,
    /// How long an acquired lock lives. Defaults to `critical_secs + 21`.
    pub lock_ttl_secs: Option<u64>,
    /// The lock waiting budget. Defaults to `critical_secs + 20`.
    pub lock_wait_secs: Option<u64>,
    /// How long backup entries are kept.
    pub backup_ttl_secs: u64,
    /// Retry behavior for store operations.
    pub retry: RetryConfig,
}

/// Extra lock lifetime on top of the critical window.
pub(crate) const LOCK_GRACE: Duration = Duration::from_secs(20);

impl StampedeConfig {
    /// The nominal freshness as a duration.
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// The critical window as a duration.
    #[must_use]
    pub fn critical(&self) -> Duration {
        Duration::from_secs(self.critical_secs)
    }

    /// The effective lock ttl.
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl_secs
            .map_or_else(|| default_lock_ttl(self.critical()), Duration::from_secs)
    }

    /// The effective lock waiting budget.
    #[must_use]
    pub fn lock_wait(&self) -> Duration {
        self.lock_wait_secs
            .map_or_else(|| default_lock_wait(self.critical()), Duration::from_secs)
    }

    /// The backup retention as a duration.
    #[must_use]
    pub fn backup_ttl(&self) -> Duration {
        Duration::from_secs(self.backup_ttl_secs)
    }
}

impl Default for StampedeConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 120,
            critical_secs: 30,
            lock_ttl_secs: None,
            lock_wait_secs: None,
            backup_ttl_secs: 24 * 60 * 60,
            retry: RetryConfig::default(),
        }
    }
}

pub(crate) fn default_lock_ttl(critical: Duration) -> Duration {
    LOCK_GRACE
        .saturating_add(critical)
        .saturating_add(Duration::from_secs(1))
}

pub(crate) fn default_lock_wait(critical: Duration) -> Duration {
    LOCK_GRACE.saturating_add(critical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_documents_use_defaults() {
        let retry: RetryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(retry, RetryConfig::default());

        let local: LocalCacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(local.max_age(), Duration::from_secs(60));

        let stampede: StampedeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(stampede, StampedeConfig::default());
        assert_eq!(stampede.max_age(), Duration::from_secs(120));
        assert_eq!(stampede.backup_ttl(), Duration::from_secs(86_400));
    }

    #[test]
    fn lock_timings_derive_from_critical() {
        let config = StampedeConfig::default();
        assert_eq!(config.lock_ttl(), Duration::from_secs(51));
        assert_eq!(config.lock_wait(), Duration::from_secs(50));
    }

    #[test]
    fn explicit_lock_timings_win() {
        let config: StampedeConfig = serde_json::from_str(r#"{ "lock_ttl_secs": 9, "lock_wait_secs": 3 }"#).unwrap();
        assert_eq!(config.lock_ttl(), Duration::from_secs(9));
        assert_eq!(config.lock_wait(), Duration::from_secs(3));
    }

    #[test]
    fn nested_retry_config() {
        let config: StampedeConfig = serde_json::from_str(r#"{ "retry": { "max_attempts": 2 } }"#).unwrap();
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.max_delay_ms, 25_000);
    }

    #[test]
    fn configs_serialize() {
        let text = serde_json::to_string(&LocalCacheConfig::default()).unwrap();
        assert_eq!(text, r#"{"max_age_secs":60,"sweep_probability":0.05}"#);
    }
}
