//! Retry policy for failed scan attempts.

use rand::Rng;
use std::time::Duration;

use crate::model::ErrorTier;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    Retry { wait: Duration },
    GiveUp,
}

/// Exponential backoff, only for transient failures.
///
/// The n-th retry waits `base_delay * 2^(n-1)`, capped at `max_delay`, then
/// scaled by a random factor in `1 ± jitter_ratio` so concurrent tools do not
/// retry in lockstep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            max_attempts: 4,
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    /// Decides what to do after `attempt` (1-based) failed with `tier`.
    pub fn decide(&self, tier: ErrorTier, attempt: u32) -> RetryDecision {
        if tier != ErrorTier::Transient || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            wait: self.jittered(self.backoff(attempt), &mut rand::thread_rng()),
        }
    }

    /// Un-jittered wait after the given failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let wait = self.base_delay.saturating_mul(1u32 << exponent);
        wait.min(self.max_delay)
    }

    fn jittered<R: Rng>(&self, wait: Duration, rng: &mut R) -> Duration {
        if self.jitter_ratio <= 0.0 {
            return wait;
        }
        let factor = 1.0 + rng.gen_range(-self.jitter_ratio..=self.jitter_ratio);
        wait.mul_f64(factor.max(0.0))
    }
}
