//! Error types for the resilience core

use crate::circuit_breaker::CircuitState;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by (or routed through) the resilience primitives
///
/// Guarded operations report their own failures with the downstream-facing
/// variants (`Transient`, `Permanent`, `Connection`, `Rejected`); the rest are
/// raised by the breaker, limiter, retry policy and pool themselves.
#[derive(Debug, Error, Clone)]
pub enum ResilienceError {
    /// Circuit breaker is open, rejecting requests without calling the dependency
    #[error("Circuit breaker '{name}' is open, rejecting requests")]
    CircuitOpen { name: String },

    /// No resource could be handed out (replacement creation failed)
    #[error("Resource pool '{pool}' is exhausted, no usable resources")]
    PoolExhausted { pool: String },

    /// No resource became free within the configured acquire timeout
    #[error("Timed out after {waited:?} waiting for a resource from pool '{pool}'")]
    AcquireTimeout { pool: String, waited: Duration },

    /// Pool has been shut down
    #[error("Resource pool '{pool}' is closed")]
    PoolClosed { pool: String },

    /// Every permitted attempt failed, or the breaker opened mid-retry
    #[error(
        "Operation '{operation}' failed after {attempts} attempt(s) in {elapsed:?} (breaker {breaker_state}): {last_error}"
    )]
    RetryExhausted {
        operation: String,
        attempts: u32,
        breaker_state: CircuitState,
        elapsed: Duration,
        #[source]
        last_error: Box<ResilienceError>,
    },

    /// Handle failed its liveness probe; only surfaced by the factory itself
    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    /// The lease was already handed back to its pool
    #[error("Lease has already been released")]
    LeaseAlreadyReleased,

    /// The lease belongs to a different pool
    #[error("Lease does not belong to this pool")]
    ForeignLease,

    /// Admission key ran out of tokens
    #[error("Rate limit exceeded for key '{key}'")]
    RateLimitExceeded { key: String },

    /// Caller-supplied deadline elapsed while waiting
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Caller cancelled while waiting
    #[error("Operation cancelled")]
    Cancelled,

    /// Guarded call did not finish within the breaker's call timeout
    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),

    /// Transient error that may be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Connection-level fault; the handle that produced it must be discarded
    #[error("Connection error: {0}")]
    Connection(String),

    /// Client-side validation failure, never counted against the dependency
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Resource factory could not create a handle
    #[error("Failed to create resource: {0}")]
    ConnectionCreation(String),

    /// Out-of-range or inconsistent configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ResilienceError {
    /// Check if this error is transient and worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transient(_)
                | ResilienceError::Timeout(_)
                | ResilienceError::Connection(_)
                | ResilienceError::ConnectionCreation(_)
                | ResilienceError::HealthCheckFailed(_)
        )
    }

    /// Check if this error should contribute to a circuit breaker's failure count
    ///
    /// Fail-fast, backpressure and client-side rejections say nothing about
    /// the dependency's health and are excluded.
    pub fn should_trip_breaker(&self) -> bool {
        !matches!(
            self,
            ResilienceError::CircuitOpen { .. }
                | ResilienceError::PoolExhausted { .. }
                | ResilienceError::AcquireTimeout { .. }
                | ResilienceError::PoolClosed { .. }
                | ResilienceError::RateLimitExceeded { .. }
                | ResilienceError::LeaseAlreadyReleased
                | ResilienceError::ForeignLease
                | ResilienceError::Rejected(_)
                | ResilienceError::InvalidConfig(_)
        )
    }

    /// Check if the handle that produced this error is no longer usable
    pub fn is_connection_fault(&self) -> bool {
        match self {
            ResilienceError::Connection(_) => true,
            ResilienceError::RetryExhausted { last_error, .. } => last_error.is_connection_fault(),
            _ => false,
        }
    }

    /// Check if this error is (or ended with) a fail-fast breaker rejection
    pub fn is_circuit_open(&self) -> bool {
        match self {
            ResilienceError::CircuitOpen { .. } => true,
            ResilienceError::RetryExhausted { last_error, .. } => last_error.is_circuit_open(),
            _ => false,
        }
    }

    /// Check if this error signals local backpressure rather than a downstream fault
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            ResilienceError::PoolExhausted { .. }
                | ResilienceError::AcquireTimeout { .. }
                | ResilienceError::PoolClosed { .. }
                | ResilienceError::RateLimitExceeded { .. }
        )
    }

    /// Number of attempts recorded on a `RetryExhausted` error
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ResilienceError::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}
