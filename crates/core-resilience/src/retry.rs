//! Bounded exponential-backoff retry
//!
//! The delay before retry number `attempt` (0-based) is
//! `base_delay * multiplier^attempt`, capped at `max_delay`. With the default
//! multiplier of 2 that is `base, 2*base, 4*base, ...`.
//!
//! When routed through a [`CircuitBreaker`], the policy never spends budget on
//! a fail-fast result: once the breaker is open it stops immediately.
//!
//! Only a first-attempt fail-fast, or a first-attempt non-retryable error that
//! left the breaker closed, is returned as-is. Every other stop is reported as
//! `RetryExhausted` with the attempt count and breaker state.

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::context::CallContext;
use super::error::ResilienceError;
use super::metrics::{MetricsSink, NoopMetrics, RetryOutcome};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Ceiling for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential policy with the default multiplier and ceiling
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::InvalidConfig(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ResilienceError::InvalidConfig(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.max_delay < self.base_delay {
            return Err(ResilienceError::InvalidConfig(
                "retry max_delay must not be shorter than base_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Retry `op` without a breaker
    pub async fn run<F, Fut, T>(
        &self,
        ctx: &CallContext,
        operation: &str,
        op: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        Retrier {
            policy: self,
            breaker: None,
            metrics: &NoopMetrics,
        }
        .run(ctx, operation, op)
        .await
    }

    /// Retry `op`, routing every attempt through `breaker`
    pub async fn run_guarded<F, Fut, T>(
        &self,
        ctx: &CallContext,
        breaker: &CircuitBreaker,
        metrics: &Arc<dyn MetricsSink>,
        operation: &str,
        op: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        Retrier {
            policy: self,
            breaker: Some(breaker),
            metrics: metrics.as_ref(),
        }
        .run(ctx, operation, op)
        .await
    }
}

struct Retrier<'a> {
    policy: &'a RetryPolicy,
    breaker: Option<&'a CircuitBreaker>,
    metrics: &'a dyn MetricsSink,
}

impl Retrier<'_> {
    async fn run<F, Fut, T>(
        &self,
        ctx: &CallContext,
        operation: &str,
        mut op: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let start = Instant::now();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            let result = match self.breaker {
                Some(breaker) => breaker.call(&mut op).await,
                None => op().await,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempts = attempt + 1, "operation succeeded after retry");
                    }
                    self.metrics.record_retry(operation, RetryOutcome::Success);
                    return Ok(value);
                }
                Err(error) => error,
            };

            let attempts = attempt + 1;
            let breaker_state = self.breaker_state();

            // First-attempt results go back untouched unless they opened the breaker
            if attempt == 0 {
                if error.is_circuit_open() {
                    return Err(error);
                }
                if !error.is_retryable() && !breaker_state.is_open() {
                    return Err(error);
                }
            }

            if !error.is_retryable()
                || error.is_circuit_open()
                || breaker_state.is_open()
                || attempts >= max_attempts
            {
                warn!(
                    operation,
                    attempts,
                    breaker = %breaker_state,
                    error = %error,
                    "giving up on operation"
                );
                self.metrics.record_retry(operation, RetryOutcome::Exhausted);
                return Err(ResilienceError::RetryExhausted {
                    operation: operation.to_string(),
                    attempts,
                    breaker_state,
                    elapsed: start.elapsed(),
                    last_error: Box::new(error),
                });
            }

            let delay = self.policy.delay_for(attempt);
            debug!(operation, attempt = attempts, ?delay, error = %error, "retrying after backoff");
            ctx.sleep(delay).await?;
            attempt += 1;
        }
    }

    fn breaker_state(&self) -> CircuitState {
        self.breaker
            .map_or(CircuitState::Closed, |breaker| breaker.state())
    }
}
