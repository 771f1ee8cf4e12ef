//! Retry schedule for lock acquisition.

use std::time::Duration;

/// Fibonacci-spaced delays: `initial, initial, 2·initial, 3·initial, 5·initial, …`.
///
/// Seeded at `(0, initial)`; every call yields the current term and advances
/// the pair. An optional cap bounds each individual delay.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    prev: Duration,
    current: Duration,
    max: Option<Duration>,
}

impl FibonacciBackoff {
    pub fn new(initial: Duration) -> Self {
        Self {
            prev: Duration::ZERO,
            current: initial,
            max: None,
        }
    }

    /// Cap every yielded delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    /// Next delay in the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.prev.saturating_add(self.current);
        self.prev = self.current;
        self.current = next;
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

impl Iterator for FibonacciBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

/// How many times a failed attempt may be retried.
///
/// Negative means retry forever, `0` means a single attempt, `N` allows up to
/// `N + 1` attempts in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget(i32);

impl RetryBudget {
    pub const UNBOUNDED: RetryBudget = RetryBudget(-1);
    pub const SINGLE_ATTEMPT: RetryBudget = RetryBudget(0);

    pub fn new(retry_count: i32) -> Self {
        Self(retry_count)
    }

    pub fn retry_count(&self) -> i32 {
        self.0
    }

    pub fn is_unbounded(&self) -> bool {
        self.0 < 0
    }

    /// Total attempts allowed, `None` when unbounded.
    pub fn max_attempts(&self) -> Option<u64> {
        if self.is_unbounded() {
            None
        } else {
            Some(self.0 as u64 + 1)
        }
    }

    /// Whether another attempt is allowed after `attempts` have failed.
    pub fn allows_another(&self, attempts: u64) -> bool {
        match self.max_attempts() {
            None => true,
            Some(max) => attempts < max,
        }
    }
}
