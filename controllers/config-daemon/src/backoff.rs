//! # Exponential Backoff
//!
//! Doubling backoff used for work queue requeues and drain retries.
//!
//! Work queue failures start at 1s and cap at 60s. Drain retries start at
//! 10s, double each step and stop after 5 steps.

use std::time::Duration;

/// Exponential backoff calculator
///
/// Each delay is the previous one multiplied by `factor`, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay (for reset)
    base: Duration,
    /// Delay returned by the next call
    current: Duration,
    /// Largest delay returned
    max: Duration,
    /// Growth factor between steps
    factor: u32,
    /// Number of delays handed out since the last reset
    attempts: u32,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `base` and doubling up to `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self::with_factor(base, max, 2)
    }

    /// Create a backoff with a custom growth factor.
    #[must_use]
    pub fn with_factor(base: Duration, max: Duration, factor: u32) -> Self {
        Self {
            base,
            current: base,
            max,
            factor: factor.max(1),
            attempts: 0,
        }
    }

    /// Work queue requeue backoff: 1s doubling up to 60s.
    #[must_use]
    pub fn for_requeue() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Get the next delay and advance the sequence.
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(self.factor), self.max);
        self.attempts += 1;
        result
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset the backoff to the initial state.
    pub fn reset(&mut self) {
        self.current = self.base;
        self.attempts = 0;
    }
}

/// Bounded retry schedule: `steps` attempts, `base` doubling by `factor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    /// Number of attempts
    pub steps: u32,
    /// Delay after the first failed attempt
    pub base: Duration,
    /// Growth factor between attempts
    pub factor: u32,
}

impl RetrySchedule {
    /// Cordon and drain: 5 steps, 10s base, factor 2.
    pub const DRAIN: RetrySchedule = RetrySchedule {
        steps: 5,
        base: Duration::from_secs(10),
        factor: 2,
    };

    /// Backoff producing the delays between attempts.
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::with_factor(self.base, Duration::MAX, self.factor)
    }
}
