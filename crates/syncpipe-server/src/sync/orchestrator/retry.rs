use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{DEFAULT_SYNC_BASE_DELAY_SECS, DEFAULT_SYNC_MAX_DELAY_SECS, DEFAULT_SYNC_MAX_RETRIES};
use crate::sync::models::duration_secs;

/// Exponential backoff: `base_delay * 2^retries_used`, capped at `max_delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(DEFAULT_SYNC_BASE_DELAY_SECS),
            max_delay: Duration::from_secs(DEFAULT_SYNC_MAX_DELAY_SECS),
            max_retries: DEFAULT_SYNC_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
        }
    }

    pub fn delay_for(&self, retries_used: u32) -> Duration {
        let factor = 2u32.checked_pow(retries_used).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn can_retry(&self, retries_used: u32) -> bool {
        retries_used < self.max_retries
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(200), 5);
        assert_eq!(policy.delay_for(0), Duration::from_secs(30));
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for(3), Duration::from_secs(200));
        assert_eq!(policy.delay_for(64), Duration::from_secs(200));
    }

    #[test]
    fn test_can_retry() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(1), 2);
        assert!(policy.can_retry(0));
        assert!(policy.can_retry(1));
        assert!(!policy.can_retry(2));
    }

    #[test]
    fn test_toml_seconds() {
        let policy: RetryPolicy = toml::from_str("base_delay = 10\nmax_delay = 90\nmax_retries = 3").unwrap();
        assert_eq!(policy.base_delay, Duration::from_secs(10));
        assert_eq!(policy.max_delay, Duration::from_secs(90));
    }
}
