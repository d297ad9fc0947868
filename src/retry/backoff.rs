//! Exponential backoff with multiplicative jitter.

use std::time::Duration;

use rand::Rng;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Growth factor per retry (>= 1.0).
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Fractional jitter; 0.2 spreads each delay over ±20%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            multiplier: 2.0,
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// A policy that never waits (useful in tests).
    pub fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            multiplier: 1.0,
            max: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (1-based) without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(30) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    /// Jittered delay before retry number `retry`, capped at `max`.
    pub fn delay_with<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor).min(self.max)
    }

    /// Jittered delay using the thread-local RNG.
    pub fn delay(&self, retry: u32) -> Duration {
        self.delay_with(retry, &mut rand::thread_rng())
    }
}
