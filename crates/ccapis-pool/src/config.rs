//! Circuit breaker configuration
//!
//! Process-wide defaults, overrideable by the `CircuitBreakerConfig` element
//! of the credentials document.

use std::time::Duration;

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive non-quota failures before the circuit opens
    pub failure_threshold: u32,
    /// Cooldown after a rate limit, and the fallback quota cooldown when no
    /// reset timestamp is known
    pub rate_limit_cooldown: Duration,
    /// Cooldown after any other failure
    pub generic_error_cooldown: Duration,
    /// Trial requests allowed while half-open
    pub half_open_retry_count: u32,
    /// Usage samples older than this are stale and re-fetched before selection
    pub recheck_usage_before_selection: Duration,
    /// When false, every account is always available
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            rate_limit_cooldown: Duration::from_secs(10 * 60),
            generic_error_cooldown: Duration::from_secs(5 * 60),
            half_open_retry_count: 1,
            recheck_usage_before_selection: Duration::from_secs(5 * 60),
            enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.rate_limit_cooldown, Duration::from_secs(600));
        assert_eq!(config.generic_error_cooldown, Duration::from_secs(300));
        assert_eq!(config.half_open_retry_count, 1);
        assert_eq!(config.recheck_usage_before_selection, Duration::from_secs(300));
        assert!(config.enabled);
    }
}
