//! Exponential backoff schedule shared by the executor and the queue.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Jitter perturbs a delay by up to this fraction in either direction.
pub const JITTER_FRACTION: f64 = 0.25;

/// Attempt budget and delay schedule.
///
/// This is the serializable half of a retry policy; queued operations carry
/// it so their schedule survives a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub exponential_base: f64,
    /// Apply a uniform ±25% perturbation.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl Backoff {
    /// Exponential schedule with jitter enabled.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// A single attempt, never delayed.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        if !self.exponential_base.is_finite() || self.exponential_base <= 1.0 {
            return Err(PolicyError::InvalidExponentialBase(self.exponential_base));
        }
        if self.max_delay < self.base_delay {
            return Err(PolicyError::DelayBoundsInverted {
                base_ms: self.base_delay.as_millis(),
                max_ms: self.max_delay.as_millis(),
            });
        }
        Ok(())
    }

    /// Whether another attempt is allowed after `attempts_used` attempts.
    pub fn allows_another(&self, attempts_used: u32) -> bool {
        attempts_used < self.max_attempts
    }

    /// Un-jittered delay after attempt `attempt` (1-indexed) failed:
    /// `min(max_delay, base_delay * exponential_base^(attempt-1))`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let max_nanos = self.max_delay.as_nanos() as f64;
        let nanos = self.base_delay.as_nanos() as f64 * self.exponential_base.powi(exponent);

        if !nanos.is_finite() || nanos >= max_nanos {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.max(0.0).round() as u64)
    }

    /// Delay to wait after attempt `attempt` failed, jittered if enabled.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.delay_after_with(attempt, &mut rand::thread_rng())
    }

    /// Like [`Backoff::delay_after`], drawing jitter from `rng`.
    pub fn delay_after_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }

        let factor = rng.gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        let nanos = nominal.as_nanos() as f64 * (1.0 + factor);
        Duration::from_nanos(nanos.max(0.0).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fixed(max_attempts: u32, base_ms: u64, max_ms: u64) -> Backoff {
        Backoff {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            exponential_base: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let backoff = fixed(5, 100, 10_000);

        assert_eq!(backoff.nominal_delay(1), Duration::from_millis(100));
        assert_eq!(backoff.nominal_delay(2), Duration::from_millis(200));
        assert_eq!(backoff.nominal_delay(3), Duration::from_millis(400));
        assert_eq!(backoff.nominal_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped_at_max_delay() {
        let backoff = fixed(50, 1_000, 5_000);

        assert_eq!(backoff.nominal_delay(3), Duration::from_millis(4_000));
        assert_eq!(backoff.nominal_delay(4), Duration::from_millis(5_000));
        assert_eq!(backoff.nominal_delay(40), Duration::from_millis(5_000));
        assert_eq!(backoff.nominal_delay(u32::MAX), Duration::from_millis(5_000));
    }

    #[test]
    fn non_integer_base_grows_geometrically() {
        let backoff = fixed(5, 1_000, 60_000).with_exponential_base(1.5);
        assert_eq!(backoff.nominal_delay(3), Duration::from_millis(2_250));
    }

    #[test]
    fn validate_rejects_degenerate_schedules() {
        assert_eq!(fixed(0, 1, 1).validate(), Err(PolicyError::ZeroAttempts));
        assert!(matches!(
            fixed(3, 1, 1).with_exponential_base(1.0).validate(),
            Err(PolicyError::InvalidExponentialBase(_))
        ));
        assert!(matches!(
            fixed(3, 10, 5).validate(),
            Err(PolicyError::DelayBoundsInverted { .. })
        ));
        assert!(Backoff::default().validate().is_ok());
    }

    #[test]
    fn allows_another_respects_max_attempts() {
        let backoff = fixed(3, 1, 1);
        assert!(backoff.allows_another(0));
        assert!(backoff.allows_another(2));
        assert!(!backoff.allows_another(3));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Jittered delays stay within [0, nominal * 1.25].
        #[test]
        fn jittered_delay_stays_in_bounds(
            base_ms in 1u64..10_000,
            extra_ms in 0u64..100_000,
            exp_base in 1.01f64..4.0,
            attempt in 1u32..30,
        ) {
            let backoff = Backoff {
                max_attempts: 30,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(base_ms + extra_ms),
                exponential_base: exp_base,
                jitter: true,
            };
            let nominal = backoff.nominal_delay(attempt);
            let delay = backoff.delay_after(attempt);
            prop_assert!(delay.as_secs_f64() <= nominal.as_secs_f64() * 1.25 + 1e-9);
        }

        /// Without jitter the delay equals the nominal schedule exactly.
        #[test]
        fn unjittered_delay_is_exact(
            base_ms in 1u64..10_000,
            extra_ms in 0u64..100_000,
            attempt in 1u32..30,
        ) {
            let backoff = fixed(30, base_ms, base_ms + extra_ms);
            let expected = (base_ms as f64 * 2f64.powi(attempt as i32 - 1))
                .min((base_ms + extra_ms) as f64);
            let delay = backoff.delay_after(attempt);
            prop_assert!((delay.as_secs_f64() * 1000.0 - expected).abs() < 1e-3);
        }
    }
}
