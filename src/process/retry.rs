//! Bounded retry policy shared by DNS configuration and proxy supervision.

use std::future::Future;
use std::time::Duration;

/// How many times an operation may be attempted and how long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
}

impl RetryPolicy {
    /// A policy allowing `max_attempts` attempts in total (at least one).
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
            backoff: Duration::ZERO,
        }
    }

    /// A policy allowing one initial attempt plus `retries` more.
    pub const fn with_retries(retries: u32) -> Self {
        Self::new(retries.saturating_add(1))
    }

    #[must_use]
    pub const fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub const fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub const fn allows_another(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }

    /// Run `op` until `done` accepts its output or attempts are exhausted.
    ///
    /// Returns the last output together with the number of attempts made.
    pub async fn run<T, F, Fut>(&self, mut op: F, done: impl Fn(&T) -> bool) -> (T, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut attempt = 1;
        loop {
            let output = op(attempt).await;
            if done(&output) || attempt >= self.max_attempts {
                return (output, attempt);
            }
            if !self.backoff.is_zero() {
                tokio::time::sleep(self.backoff).await;
            }
            attempt += 1;
        }
    }
}
