//! `[registry]` section configuration.
//!
//! # Example
//!
//! ```toml
//! [registry]
//! cache_dir = ".gpkg-cache"   # download target for remote storage
//! index_policy = "degrade"    # "degrade" or "fail" on spatial index errors
//! reconcile_secs = 300        # periodic full reconciliation (0 = off)
//!
//! [registry.retry]
//! max_attempts = 4
//! initial_backoff_ms = 250
//! max_backoff_ms = 8000
//! multiplier = 2.0
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a failed spatial index build does to a load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexPolicy {
    /// Publish the package; the layer is scanned without an index.
    #[default]
    Degrade,
    /// Fail the load.
    Fail,
}

/// Retry policy for storage failures during load/reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 250,
            max_backoff_ms: 8000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.powi(exp);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Package registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySectionConfig {
    /// Download destination for packages that are not on local disk.
    pub cache_dir: PathBuf,

    pub index_policy: IndexPolicy,

    /// Interval of periodic full reconciliation in seconds, 0 disables it.
    pub reconcile_secs: u64,

    pub retry: RetryConfig,
}

impl Default for RegistrySectionConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".gpkg-cache"),
            index_policy: IndexPolicy::Degrade,
            reconcile_secs: 0,
            retry: RetryConfig::default(),
        }
    }
}

impl RegistrySectionConfig {
    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_secs > 0).then(|| Duration::from_secs(self.reconcile_secs))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{IndexPolicy, RetryConfig};
    use crate::config::test_parse_config;

    #[test]
    fn test_registry_config_defaults() {
        let config = test_parse_config("");
        assert_eq!(config.registry.index_policy, IndexPolicy::Degrade);
        assert_eq!(config.registry.reconcile_interval(), None);
        assert_eq!(config.registry.retry.max_attempts, 4);
    }

    #[test]
    fn test_registry_config_override() {
        let config = test_parse_config(
            "[registry]\nindex_policy = \"fail\"\nreconcile_secs = 60\n\n[registry.retry]\nmax_attempts = 2",
        );
        assert_eq!(config.registry.index_policy, IndexPolicy::Fail);
        assert_eq!(config.registry.reconcile_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.registry.retry.max_attempts, 2);
        assert_eq!(config.registry.retry.initial_backoff_ms, 250);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let retry = RetryConfig {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            multiplier: 2.0,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(5), Duration::from_millis(1000));
        assert_eq!(retry.backoff(60), Duration::from_millis(1000));
    }
}
