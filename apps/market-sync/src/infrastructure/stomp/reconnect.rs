//! Reconnection Policy
//!
//! Exponential backoff with a hard attempt ceiling:
//! `delay(attempt) = base * 2^attempt` for `attempt < max_attempts`,
//! `None` afterwards. The delay function is pure; optional jitter is applied
//! separately by the caller.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub base_delay: Duration,
    /// Number of reconnection attempts before giving up.
    pub max_attempts: u32,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization). 0 disables.
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
            jitter_factor: 0.0,
        }
    }
}

impl ReconnectConfig {
    /// Create a new configuration without jitter.
    #[must_use]
    pub const fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            jitter_factor: 0.0,
        }
    }
}

/// Stateless reconnection policy.
///
/// # Example
///
/// ```rust
/// use market_sync::infrastructure::stomp::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let policy = ReconnectPolicy::new(ReconnectConfig::new(Duration::from_secs(1), 5));
///
/// assert_eq!(policy.delay(0), Some(Duration::from_secs(1)));
/// assert_eq!(policy.delay(4), Some(Duration::from_secs(16)));
/// assert_eq!(policy.delay(5), None);
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Maximum number of attempts.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Delay before reconnection attempt `attempt` (0-based).
    ///
    /// Returns `None` once `attempt` reaches `max_attempts`. Saturates at
    /// `Duration::MAX` instead of overflowing.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.config.max_attempts {
            return None;
        }

        let delay = 2_u32
            .checked_pow(attempt)
            .and_then(|factor| self.config.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX);
        Some(delay)
    }

    /// Apply the configured jitter to a delay.
    #[must_use]
    pub fn jittered(&self, delay: Duration) -> Duration {
        if !(self.config.jitter_factor.is_finite() && self.config.jitter_factor > 0.0) {
            return delay;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = delay.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_attempts, 5);
        assert!(config.jitter_factor.abs() < f64::EPSILON);
    }

    #[test]
    fn doubles_until_ceiling() {
        let policy = ReconnectPolicy::new(ReconnectConfig::new(Duration::from_millis(1000), 5));

        let delays: Vec<_> = (0..6).map(|attempt| policy.delay(attempt)).collect();

        assert_eq!(
            delays,
            vec![
                Some(Duration::from_millis(1000)),
                Some(Duration::from_millis(2000)),
                Some(Duration::from_millis(4000)),
                Some(Duration::from_millis(8000)),
                Some(Duration::from_millis(16000)),
                None,
            ]
        );
    }

    #[test]
    fn zero_attempts_never_retries() {
        let policy = ReconnectPolicy::new(ReconnectConfig::new(Duration::from_secs(1), 0));
        assert_eq!(policy.max_attempts(), 0);
        assert_eq!(policy.delay(0), None);
    }

    #[test]
    fn saturates_instead_of_overflowing() {
        let policy = ReconnectPolicy::new(ReconnectConfig::new(Duration::from_secs(1), u32::MAX));
        assert_eq!(policy.delay(40), Some(Duration::MAX));
        assert_eq!(policy.delay(200), Some(Duration::MAX));
    }

    #[test]
    fn jitter_bounds() {
        let policy = ReconnectPolicy::new(ReconnectConfig {
            base_delay: Duration::from_millis(1000),
            max_attempts: 5,
            jitter_factor: 0.1,
        });

        for _ in 0..100 {
            let millis = policy.jittered(Duration::from_millis(1000)).as_millis();
            assert!(millis >= 900, "delay {millis}ms is below minimum 900ms");
            assert!(millis <= 1100, "delay {millis}ms is above maximum 1100ms");
        }
    }

    #[test]
    fn no_jitter_by_default() {
        let policy = ReconnectPolicy::new(ReconnectConfig::default());
        assert_eq!(
            policy.jittered(Duration::from_millis(1234)),
            Duration::from_millis(1234)
        );
    }

    #[test]
    fn non_finite_jitter_is_ignored() {
        for jitter_factor in [f64::NAN, f64::INFINITY, -0.5] {
            let policy = ReconnectPolicy::new(ReconnectConfig {
                base_delay: Duration::from_millis(100),
                max_attempts: 3,
                jitter_factor,
            });
            assert_eq!(
                policy.jittered(Duration::from_millis(500)),
                Duration::from_millis(500)
            );
        }
    }

    proptest! {
        #[test]
        fn delay_is_base_times_power_of_two(
            base_ms in 1u64..10_000,
            max_attempts in 1u32..20,
            attempt in 0u32..40,
        ) {
            let policy = ReconnectPolicy::new(ReconnectConfig::new(
                Duration::from_millis(base_ms),
                max_attempts,
            ));

            let delay = policy.delay(attempt);
            if attempt < max_attempts {
                prop_assert_eq!(delay, Some(Duration::from_millis(base_ms << attempt)));
            } else {
                prop_assert_eq!(delay, None);
            }
        }
    }
}
