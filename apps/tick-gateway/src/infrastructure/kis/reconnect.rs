//! Reconnection Backoff
//!
//! Exponential backoff with jitter and a hard ceiling on consecutive
//! failures. The delay after the `n`-th consecutive failure is
//! `min(initial * multiplier^(n-1), max)`; once `max_attempts` failures
//! have accumulated the policy gives up for good.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Consecutive failures tolerated before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 10,
        }
    }
}

/// What to do after a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Sleep for the delay, then try again.
    Retry(Duration),
    /// The ceiling was reached; stop reconnecting.
    GiveUp {
        /// Consecutive failures observed.
        attempts: u32,
    },
}

/// Per-bridge backoff state.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tick_gateway::infrastructure::kis::reconnect::{Backoff, ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig {
///     jitter_factor: 0.0,
///     max_attempts: 2,
///     ..ReconnectConfig::default()
/// });
///
/// assert_eq!(policy.record_failure(), Backoff::Retry(Duration::from_secs(5)));
/// assert_eq!(policy.record_failure(), Backoff::GiveUp { attempts: 2 });
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    failures: u32,
}

impl ReconnectPolicy {
    /// Create a policy with no recorded failures.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Record a failed attempt and decide whether to retry.
    pub fn record_failure(&mut self) -> Backoff {
        self.failures = self.failures.saturating_add(1);

        if self.config.max_attempts > 0 && self.failures >= self.config.max_attempts {
            return Backoff::GiveUp {
                attempts: self.failures,
            };
        }

        Backoff::Retry(self.apply_jitter(self.delay_for(self.failures - 1)))
    }

    /// Forget past failures after a successful connection.
    pub const fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Un-jittered delay for a zero-based attempt index.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.config.initial_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        let max = self.config.max_delay.as_secs_f64();

        if scaled.is_finite() && scaled < max {
            Duration::from_secs_f64(scaled.max(0.0))
        } else {
            self.config.max_delay
        }
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || duration.is_zero() {
            return duration;
        }

        let base = duration.as_secs_f64();
        let range = base * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-range..=range);
        Duration::from_secs_f64((base + jitter).max(0.001))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig {
            jitter_factor: 0.0,
            max_attempts,
            ..ReconnectConfig::default()
        })
    }

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(5));
        assert_eq!(config.max_delay, Duration::from_secs(300));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.max_attempts, 10);
    }

    #[test]
    fn delays_double_until_capped() {
        let mut policy = policy(0);

        let delays: Vec<u64> = (0..9)
            .map(|_| match policy.record_failure() {
                Backoff::Retry(delay) => delay.as_secs(),
                Backoff::GiveUp { .. } => panic!("unlimited policy gave up"),
            })
            .collect();

        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300, 300]);
    }

    #[test]
    fn gives_up_on_the_tenth_failure() {
        let mut policy = policy(10);

        for _ in 0..9 {
            assert!(matches!(policy.record_failure(), Backoff::Retry(_)));
        }

        assert_eq!(policy.record_failure(), Backoff::GiveUp { attempts: 10 });
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut policy = policy(3);
        let _ = policy.record_failure();
        let _ = policy.record_failure();

        policy.reset();

        assert_eq!(policy.failures(), 0);
        assert_eq!(
            policy.record_failure(),
            Backoff::Retry(Duration::from_secs(5))
        );
    }

    #[test]
    fn huge_attempt_index_saturates_at_max() {
        assert_eq!(policy(0).delay_for(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                initial_delay: Duration::from_millis(1000),
                jitter_factor: 0.1,
                max_attempts: 0,
                ..ReconnectConfig::default()
            });

            let Backoff::Retry(delay) = policy.record_failure() else {
                panic!("unlimited policy gave up");
            };
            let millis = delay.as_millis();
            assert!((900..=1100).contains(&millis), "delay {millis}ms out of range");
        }
    }
}
