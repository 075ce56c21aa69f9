//! Retry logic with linear backoff for upstream chat calls.
//!
//! Only `chat` retries. Session creation is a single attempt and surfaces its
//! failure directly.

use crate::error::UpstreamError;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Suspends between attempts. Injected so tests can record delays instead of
/// waiting on the wall clock.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Configuration for retry behavior
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt)
    pub max_attempts: u32,
    /// Delay unit; attempt `n` (0-based) waits `n * backoff_step`
    pub backoff_step: Duration,
    pub sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff_step", &self.backoff_step)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_secs(2),
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

impl RetryPolicy {
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Delay before 0-based `attempt`: 0s, 2s, 4s, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is spent.
    ///
    /// Exhaustion yields [`UpstreamError::Exhausted`] wrapping the last
    /// failure. Non-retryable errors are returned as-is.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, UpstreamError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let mut last: Option<UpstreamError> = None;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let delay = self.delay_for(attempt);
                debug!(
                    attempt = attempt + 1,
                    max_attempts = self.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying khoj API call"
                );
                self.sleeper.sleep(delay).await;
            }

            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt = attempt + 1, "khoj API call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => {
                    debug!(error = %err, "error is not retryable, failing immediately");
                    return Err(err);
                }
                Err(err) => {
                    warn!(attempt = attempt + 1, error = %err, "khoj API call failed");
                    last = Some(err);
                }
            }
        }

        let last = last.unwrap_or(UpstreamError::Decode("no attempts were made".to_string()));
        Err(UpstreamError::Exhausted {
            attempts: self.max_attempts,
            last: Box::new(last),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records requested delays without sleeping.
    #[derive(Default)]
    pub struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        pub fn delays(&self) -> Vec<Duration> {
            self.delays.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
        }
    }
}
