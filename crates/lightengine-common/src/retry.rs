//! Retry timing helpers
//!
//! Two shapes of retry exist in the engine: exponential backoff with a
//! ceiling for batch reads that report unprocessed keys, and jittered delays
//! for read-verify-write reconciliation loops.

use rand::Rng;
use std::time::Duration;

/// Default attempt budget shared by the retry loops.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Exponential backoff schedule: `base * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay,
            max_attempts,
        }
    }

    /// A schedule with no waiting, for tests and in-memory backends.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, max_attempts)
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_delay)
    }

    /// Jittered variant of [`Backoff::delay`].
    pub fn jittered(&self, attempt: u32) -> Duration {
        jittered_delay(self.delay(attempt))
    }

    pub async fn sleep(&self, attempt: u32) {
        let delay = self.delay(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    pub async fn sleep_jittered(&self, attempt: u32) {
        let delay = self.jittered(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Uniformly random delay in `[base / 2, base]`.
pub fn jittered_delay(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let max = base.as_millis().min(u64::MAX as u128) as u64;
    let min = max / 2;
    if max <= min {
        return base;
    }
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}
