//! Caller-supplied deadline and cancellation
//!
//! Every suspension point in this crate (waiting for a pooled resource,
//! waiting for rate-limit tokens, sleeping between retries) runs through
//! [`CallContext::run`], so a single context aborts all of them the same way.

use crate::error::ResilienceError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline and cancellation token carried through a guarded call
///
/// Cloning shares the cancellation token; cancelling any clone cancels all.
///
/// # Example
/// ```
/// use gatehouse_core_resilience::CallContext;
/// use std::time::Duration;
///
/// let ctx = CallContext::with_timeout(Duration::from_secs(2));
/// assert!(ctx.deadline().is_some());
/// assert!(!ctx.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    /// Context with no deadline and a fresh cancellation token
    pub fn new() -> Self {
        Self::default()
    }

    /// Context whose deadline is `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().with_deadline(Instant::now() + timeout)
    }

    /// Set an absolute deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Use an externally owned cancellation token (e.g. the request's)
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel every wait running under this context
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the deadline, `None` when there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Fail immediately if the context is already cancelled or expired
    pub fn check(&self) -> Result<(), ResilienceError> {
        if self.cancel.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(ResilienceError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Drive `fut` to completion unless the context is cancelled or expires first
    ///
    /// Cancellation wins over the deadline, which wins over a future that
    /// becomes ready in the same poll.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ResilienceError>
    where
        F: Future,
    {
        self.check()?;

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ResilienceError::Cancelled),
            _ = deadline => Err(ResilienceError::DeadlineExceeded),
            output = fut => Ok(output),
        }
    }

    /// Cancellable sleep
    pub async fn sleep(&self, duration: Duration) -> Result<(), ResilienceError> {
        self.run(tokio::time::sleep(duration)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_before_deadline() {
        let ctx = CallContext::with_timeout(Duration::from_secs(5));
        let out = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                7
            })
            .await;
        assert_eq!(out.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let ctx = CallContext::with_timeout(Duration::from_millis(100));
        let start = Instant::now();
        let err = ctx.sleep(Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, ResilienceError::DeadlineExceeded));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_sleep() {
        let ctx = CallContext::new();
        let child = ctx.clone();
        let waiter = tokio::spawn(async move { child.sleep(Duration::from_secs(3600)).await });

        tokio::task::yield_now().await;
        ctx.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ResilienceError::Cancelled));
    }

    #[test]
    fn test_check_on_cancelled_context() {
        let ctx = CallContext::new();
        assert!(ctx.check().is_ok());
        assert!(ctx.remaining().is_none());
        ctx.cancel();
        assert!(matches!(ctx.check(), Err(ResilienceError::Cancelled)));
    }
}
