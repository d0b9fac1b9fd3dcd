//! Retry policy for transient send failures.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Outcome of consulting the policy after a transient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first try; a recipient sees at most
    /// `max_retries + 1` attempts.
    ///
    /// Default: 3
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry. Each following retry doubles it:
    /// `base * 2^(try - 1)`.
    ///
    /// Default: 1000 ms
    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on a single backoff.
    ///
    /// Default: 60000 ms
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    /// Randomises each delay within ±`jitter_factor`.
    ///
    /// Default: 0.0 (deterministic)
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            base_delay_ms: defaults::base_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// # Errors
    ///
    /// Returns [`ConfigError::RetryPolicy`] when the jitter factor is outside
    /// `0.0..=1.0` or the cap is below the base delay.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::RetryPolicy(format!(
                "jitter_factor must be within 0.0..=1.0, got {}",
                self.jitter_factor
            )));
        }

        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::RetryPolicy(format!(
                "max_delay_ms ({}) is below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }

        Ok(())
    }

    /// Decide what to do after try number `try_number` (1-based) failed
    /// transiently.
    #[must_use]
    pub fn decide(&self, try_number: u32) -> RetryDecision {
        if try_number > self.max_retries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.backoff(try_number))
        }
    }

    /// Delay that follows failed try `try_number`
    #[must_use]
    pub fn backoff(&self, try_number: u32) -> Duration {
        calculate_backoff(
            try_number,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
        )
    }

    /// Same policy with base and cap multiplied (filtering-prone domains)
    #[must_use]
    pub fn scaled(&self, multiplier: u32) -> Self {
        let multiplier = u64::from(multiplier.max(1));
        Self {
            base_delay_ms: self.base_delay_ms.saturating_mul(multiplier),
            max_delay_ms: self.max_delay_ms.saturating_mul(multiplier),
            ..self.clone()
        }
    }
}

/// `delay = min(base * 2^(try - 1), max) * (1 ± jitter)`
pub fn calculate_backoff(
    try_number: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
) -> Duration {
    let exponent = try_number.saturating_sub(1);
    let delay = if exponent >= 63 {
        max_delay_ms
    } else {
        base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(max_delay_ms)
    };

    if jitter_factor <= 0.0 {
        return Duration::from_millis(delay);
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let jittered = {
        let range = (delay as f64) * jitter_factor;
        let jitter: f64 = rand::rng().random_range(-range..=range);
        ((delay as f64) + jitter).max(0.0) as u64
    };

    Duration::from_millis(jittered)
}

mod defaults {
    pub const fn max_retries() -> u32 {
        3
    }

    pub const fn base_delay_ms() -> u64 {
        1000
    }

    pub const fn max_delay_ms() -> u64 {
        60_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 60_000);
        assert!(policy.jitter_factor.abs() < f64::EPSILON);
    }

    #[test]
    fn test_decide_doubles_then_gives_up() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(1), RetryDecision::RetryAfter(Duration::from_secs(1)));
        assert_eq!(policy.decide(2), RetryDecision::RetryAfter(Duration::from_secs(2)));
        assert_eq!(policy.decide(3), RetryDecision::RetryAfter(Duration::from_secs(4)));
        assert_eq!(policy.decide(4), RetryDecision::GiveUp);
    }

    #[test]
    fn test_zero_retries_gives_up_immediately() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.decide(1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(calculate_backoff(10, 1000, 5000, 0.0), Duration::from_millis(5000));
        assert_eq!(calculate_backoff(100, 1000, 5000, 0.0), Duration::from_millis(5000));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        for _ in 0..100 {
            let delay = calculate_backoff(1, 1000, 60_000, 0.2).as_millis();
            assert!((800..=1200).contains(&delay), "delay {delay} outside ±20%");
        }
    }

    #[test]
    fn test_scaled_policy() {
        let policy = RetryPolicy::default().scaled(2);
        assert_eq!(policy.base_delay_ms, 2000);
        assert_eq!(policy.max_delay_ms, 120_000);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.decide(2), RetryDecision::RetryAfter(Duration::from_secs(4)));
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());

        let bad_jitter = RetryPolicy {
            jitter_factor: 1.5,
            ..RetryPolicy::default()
        };
        assert!(bad_jitter.validate().is_err());

        let bad_cap = RetryPolicy {
            max_delay_ms: 10,
            ..RetryPolicy::default()
        };
        assert!(bad_cap.validate().is_err());
    }
}
