//! Bounded fixed-delay retry
//!
//! Used where the appliance acknowledges a create before the object is
//! usable: the dependent step is retried a bounded number of times with a
//! constant pause in between.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Default number of attempts for a retried step
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default pause between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Result of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Done(T),
    /// Not yet; try again if attempts remain
    Retry,
}

/// How often and how patiently to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (at least 1)
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// No pause between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Run `operation` until it is done, fails, or the attempts run out.
    ///
    /// Errors end the loop immediately. Returns `None` once every attempt
    /// asked for a retry.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<Option<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Attempt<T>>>,
    {
        let max_attempts = self.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match operation(attempt).await? {
                Attempt::Done(value) => return Ok(Some(value)),
                Attempt::Retry if attempt < max_attempts => {
                    debug!(
                        operation = %operation_name,
                        attempt = attempt,
                        delay_ms = self.delay.as_millis() as u64,
                        "Not ready, retrying"
                    );
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                }
                Attempt::Retry => {}
            }
        }

        Ok(None)
    }
}
