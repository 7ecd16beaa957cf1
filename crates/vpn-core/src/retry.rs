//! Retry limits and backoff schedule.
//!
//! A [`RetryPolicy`] is a pure description: it holds no counters.  The
//! per-operation attempt counter lives in the operation that consumes the
//! policy, and is passed back in to compute each delay.

use std::time::Duration;

use rand::Rng;

/// Classifies an error as worth another attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `initial * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        initial: Duration,
        multiplier: u32,
        max: Duration,
    },
}

/// Retry limits for one kind of operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.  Always at least 1.
    max_attempts: u32,
    backoff: Backoff,
    /// Fraction in `0.0..=1.0` of each delay that is randomized.
    jitter: f64,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn never() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed(Duration::ZERO),
            jitter: 0.0,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(delay),
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential {
                initial,
                multiplier: 2,
                max,
            },
            jitter: 0.0,
        }
    }

    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        if let Backoff::Exponential { initial, max, .. } = self.backoff {
            self.backoff = Backoff::Exponential {
                initial,
                multiplier: multiplier.max(1),
                max,
            };
        }
        self
    }

    /// Randomizes up to `fraction` of each delay (clamped to `0.0..=1.0`).
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before the next attempt, without jitter.
    ///
    /// `attempts_made` is the number of attempts that have already run, so
    /// the first retry uses `base_delay(1)`.
    pub fn base_delay(&self, attempts_made: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = attempts_made.saturating_sub(1).min(31);
                let factor = multiplier.saturating_pow(exponent);
                initial.saturating_mul(factor).min(max)
            }
        }
    }

    /// Delay before the next attempt, with jitter applied.
    ///
    /// Jitter only ever shortens the delay, so the result never exceeds
    /// [`base_delay`](Self::base_delay).
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let base = self.base_delay(attempts_made);
        if self.jitter == 0.0 || base.is_zero() {
            return base;
        }
        let cut = rand::thread_rng().gen_range(0.0..=self.jitter);
        base.mul_f64(1.0 - cut)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}
