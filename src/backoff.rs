//! Reconnect backoff shared by the vMix and relay clients.
//!
//! The delay before retry `n` (0-based) is `min(base × 2^n, cap)`. Attempts
//! are capped; once the cap is reached the policy stays exhausted until an
//! explicit [`Backoff::reset`] (a fresh `connect()` call).
//!
//! A deliberate `disconnect()` calls [`Backoff::disarm`], which pushes the
//! counter to the cap so any reconnect already racing the shutdown sees an
//! exhausted policy and stops.

use std::time::Duration;

use crate::constants::{MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY, RECONNECT_MAX_DELAY};

/// A scheduled reconnect: which attempt it is and how long to wait first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    /// 1-based attempt number (the counter value after scheduling).
    pub attempt: u32,
    /// Delay before the attempt is made.
    pub delay: Duration,
}

/// Exponential reconnect policy with an attempt cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(RECONNECT_BASE_DELAY, RECONNECT_MAX_DELAY, MAX_RECONNECT_ATTEMPTS)
    }
}

impl Backoff {
    /// Create a policy with a custom schedule.
    #[must_use]
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            attempts: 0,
        }
    }

    /// Delay for the given 0-based attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        // 2^31 ms already dwarfs any sane cap; saturate instead of overflowing
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Schedule the next retry, or `None` when attempts are exhausted.
    ///
    /// The delay is computed from the current counter, which is then
    /// incremented.
    pub fn schedule(&mut self) -> Option<Retry> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.delay_for(self.attempts);
        self.attempts += 1;
        Some(Retry {
            attempt: self.attempts,
            delay,
        })
    }

    /// Reset the counter (explicit connect or successful reconnect).
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Suppress reconnection until the next [`Self::reset`].
    pub fn disarm(&mut self) {
        self.attempts = self.max_attempts;
    }

    /// Whether no further retries may be scheduled.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Retries scheduled since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Attempt cap.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
