//! Relay reconnection policy

use crate::config::ReconnectSettings;
use std::time::Duration;

/// Reconnection policy for a signaling channel
///
/// Controls how reconnection attempts are made when the relay connection
/// drops or cannot be established.
#[derive(Debug, Clone)]
pub struct ReconnectionPolicy {
    /// Maximum number of reconnection attempts (default: 5)
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds (default: 1000ms)
    pub backoff_initial_ms: u64,
    /// Maximum backoff delay in milliseconds (default: 5000ms)
    pub backoff_max_ms: u64,
    /// Timeout for one connect attempt in milliseconds (default: 20000ms)
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for ReconnectionPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            max_retries: settings.max_attempts,
            backoff_initial_ms: settings.backoff_initial_ms,
            backoff_max_ms: settings.backoff_max_ms,
            connect_timeout_ms: settings.connect_timeout_ms,
        }
    }
}

impl ReconnectionPolicy {
    /// Calculate backoff duration for a given attempt number
    ///
    /// Linear growth from the initial delay, capped at the maximum.
    ///
    /// # Arguments
    /// * `attempt` - Current attempt number (0-indexed)
    ///
    /// # Returns
    /// Duration to wait before the next reconnection attempt
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let backoff_ms = self
            .backoff_initial_ms
            .saturating_mul(u64::from(attempt) + 1)
            .min(self.backoff_max_ms);

        Duration::from_millis(backoff_ms)
    }

    /// Check if more retries are allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Timeout applied to each connect attempt
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_linear_then_capped() {
        let policy = ReconnectionPolicy::default();
        let delays: Vec<u64> = (0..7)
            .map(|a| policy.calculate_backoff(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 3000, 4000, 5000, 5000, 5000]);
    }

    #[test]
    fn test_should_retry() {
        let policy = ReconnectionPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert_eq!(policy.connect_timeout(), Duration::from_secs(20));
    }
}
