//! Retry schedule for failed deliveries.
//!
//! `next_delay(n) = min(initial * multiplier^(n-1), max)`; with the defaults
//! that is 30s, 60s, 120s, 240s, 480s. The policy is a pure value; jitter is
//! applied separately to the wall-clock spacing.

use std::time::Duration;

use rand::Rng;

use courier_common::types::RetryPolicySpec;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_MULTIPLIER: u32 = 2;
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(480);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            multiplier: DEFAULT_MULTIPLIER,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Resolve a per-notification override against the defaults.
    pub fn from_spec(spec: Option<&RetryPolicySpec>) -> Self {
        let defaults = Self::default();
        let Some(spec) = spec else {
            return defaults;
        };

        Self {
            max_attempts: spec.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            initial_backoff: spec
                .initial_backoff_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.initial_backoff),
            multiplier: spec.backoff_multiplier.unwrap_or(defaults.multiplier).max(1),
            max_backoff: spec
                .max_backoff_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_backoff),
        }
    }

    /// Delay to wait after attempt `attempt` (1-based) failed.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exponent);
        let initial_ms = u64::try_from(self.initial_backoff.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(initial_ms.saturating_mul(factor)).min(self.max_backoff)
    }

    /// Wall-clock wait after `attempt`: the jittered schedule, stretched to a
    /// provider hint when the hint is longer.
    pub fn retry_delay(&self, attempt: u32, hint: Option<Duration>, jitter: f64) -> Duration {
        let computed = jittered(self.next_delay(attempt), jitter);
        hint.map_or(computed, |h| h.max(computed))
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Spread `delay` by ±`fraction`. A fraction of 0 returns the delay unchanged.
pub fn jittered(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 || delay.is_zero() {
        return delay;
    }
    let fraction = fraction.min(1.0);
    let factor = rand::rng().random_range((1.0 - fraction)..=(1.0 + fraction));
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|n| policy.next_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![30, 60, 120, 240, 480]);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(6), Duration::from_secs(480));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(480));
    }

    #[test]
    fn test_exhaustion() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
        assert!(policy.is_exhausted(6));
    }

    #[test]
    fn test_from_spec_overrides_and_clamps() {
        let spec = RetryPolicySpec {
            max_attempts: Some(0),
            initial_backoff_seconds: Some(1),
            backoff_multiplier: Some(0),
            max_backoff_seconds: Some(10),
        };
        let policy = RetryPolicy::from_spec(Some(&spec));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.multiplier, 1);
        assert_eq!(policy.next_delay(3), Duration::from_secs(1));

        let partial = RetryPolicySpec {
            max_attempts: Some(3),
            ..Default::default()
        };
        let policy = RetryPolicy::from_spec(Some(&partial));
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, DEFAULT_INITIAL_BACKOFF);
    }

    #[test]
    fn test_hint_only_extends_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.retry_delay(1, Some(Duration::from_secs(5)), 0.0),
            Duration::from_secs(30)
        );
        assert_eq!(
            policy.retry_delay(1, Some(Duration::from_secs(90)), 0.0),
            Duration::from_secs(90)
        );
        // Jitter never pulls the wait below the hint
        for _ in 0..50 {
            assert!(policy.retry_delay(1, Some(Duration::from_secs(40)), 0.5) >= Duration::from_secs(40));
        }
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(100);
        assert_eq!(jittered(base, 0.0), base);
        for _ in 0..100 {
            let d = jittered(base, 0.1);
            assert!(d >= Duration::from_secs(90) && d <= Duration::from_secs(110));
        }
    }
}
