//! Capped exponential backoff for collaborator calls.

use std::time::Duration;

use rand::Rng;

const MAX_EXPONENT: u32 = 20;

/// `base * 2^attempt`, capped at `cap`.
///
/// `attempt` is the number of failures observed so far.
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let factor = 2_u32.pow(attempt.min(MAX_EXPONENT));
    base.saturating_mul(factor).min(cap)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random delay added to each backoff.
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn allows_another_attempt(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before the attempt following failure number `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = backoff_delay(self.base_delay, attempt, self.max_delay);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        delay.saturating_add(Duration::from_millis(extra)).min(self.max_delay)
    }
}
