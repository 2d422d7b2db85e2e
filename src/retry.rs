//! Bounded exponential backoff for read-after-write lag.
//!
//! The attempt-to-delay mapping is pure so it can be tested without a clock;
//! [`RetryPolicy::run`] is the async driver that actually sleeps.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

/// What a single attempt produced.
pub enum Attempt<T> {
    Done(T),
    /// Try again after the backoff delay.
    Retry,
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt:
    /// base, 2*base, 4*base, ... Returns `None` past the last attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor))
    }

    /// Run `op` until it returns `Attempt::Done` or the attempts run out.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Option<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        for attempt in 1..=self.max_attempts {
            if let Attempt::Done(value) = op(attempt).await {
                return Some(value);
            }
            if let Some(delay) = self.delay_for_attempt(attempt) {
                tokio::time::sleep(delay).await;
            }
        }
        None
    }
}
