//! Per-call cancellation and deadline.

use crate::error::UpstreamError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Cancellation scope for one inbound request.
///
/// The front door creates one per request and keeps a [`DropGuard`] alive for
/// as long as the response is being produced, so a client disconnect (which
/// drops the response) cancels any in-flight upstream call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some((Instant::now() + timeout, timeout)),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.is_expired()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline
            .map(|(at, _)| Instant::now() >= at)
            .unwrap_or(false)
    }

    pub fn drop_guard(&self) -> DropGuard {
        self.cancel.clone().drop_guard()
    }

    /// Run `fut` until it completes, the context is cancelled, or the deadline
    /// passes, whichever comes first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, UpstreamError>
    where
        F: Future<Output = Result<T, UpstreamError>>,
    {
        match self.deadline {
            Some((at, after)) => tokio::select! {
                res = fut => res,
                _ = self.cancel.cancelled() => Err(UpstreamError::Cancelled),
                _ = tokio::time::sleep_until(at) => Err(UpstreamError::Timeout { after }),
            },
            None => tokio::select! {
                res = fut => res,
                _ = self.cancel.cancelled() => Err(UpstreamError::Cancelled),
            },
        }
    }

    /// Fail fast if the context is already done.
    pub fn check(&self) -> Result<(), UpstreamError> {
        if let Some((at, after)) = self.deadline {
            if Instant::now() >= at {
                return Err(UpstreamError::Timeout { after });
            }
        }
        if self.cancel.is_cancelled() {
            return Err(UpstreamError::Cancelled);
        }
        Ok(())
    }
}
