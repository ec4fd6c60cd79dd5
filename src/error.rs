/*!
 * Error types for Gatehouse
 *
 * `GatewayError` is what a request handler turns into a response. Its
 * messages are safe to show to API users; breaker and pool internals only
 * ever reach the logs.
 */

use gatehouse_core_resilience::ResilienceError;
use thiserror::Error;
use tracing::warn;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration error, fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// A dependency is shedding load (breaker open, pool saturated or closed)
    #[error("{dependency} is temporarily unavailable, please retry later")]
    Unavailable { dependency: String },

    /// The caller's quota is used up
    #[error("rate limit exceeded, please slow down")]
    RateLimited,

    /// A dependency kept failing
    #[error("upstream {dependency} failed to respond")]
    DependencyFailure { dependency: String },

    /// The request itself was invalid
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The request ran out of time or was cancelled
    #[error("request timed out")]
    Timeout,

    /// Bug in the gateway itself
    #[error("internal error")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// HTTP status code a front end should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::BadRequest(_) => 400,
            GatewayError::RateLimited => 429,
            GatewayError::DependencyFailure { .. } => 502,
            GatewayError::Unavailable { .. } => 503,
            GatewayError::Timeout => 504,
            GatewayError::Config(_) | GatewayError::Internal(_) | GatewayError::Io(_) => 500,
        }
    }

    /// Short stable label, used in logs and simulation summaries
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config",
            GatewayError::Unavailable { .. } => "unavailable",
            GatewayError::RateLimited => "rate_limited",
            GatewayError::DependencyFailure { .. } => "dependency_failure",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::Timeout => "timeout",
            GatewayError::Internal(_) => "internal",
            GatewayError::Io(_) => "io",
        }
    }

    /// Whether the client may reasonably retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Unavailable { .. }
                | GatewayError::RateLimited
                | GatewayError::DependencyFailure { .. }
                | GatewayError::Timeout
        )
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            GatewayError::Config(_) | GatewayError::Io(_) => EXIT_FATAL,
            _ => EXIT_PARTIAL,
        }
    }
}

impl From<ResilienceError> for GatewayError {
    fn from(err: ResilienceError) -> Self {
        let mapped = match &err {
            ResilienceError::CircuitOpen { name } => GatewayError::Unavailable {
                dependency: name.clone(),
            },
            // Retries that ended on the breaker shed load like a plain fail-fast
            ResilienceError::RetryExhausted { operation, .. } if err.is_circuit_open() => {
                GatewayError::Unavailable {
                    dependency: operation.clone(),
                }
            }
            ResilienceError::RetryExhausted { last_error, .. }
                if matches!(**last_error, ResilienceError::Rejected(_)) =>
            {
                GatewayError::BadRequest(last_error.to_string())
            }
            ResilienceError::RetryExhausted { last_error, .. }
                if matches!(
                    **last_error,
                    ResilienceError::Cancelled | ResilienceError::DeadlineExceeded
                ) =>
            {
                GatewayError::Timeout
            }
            ResilienceError::PoolExhausted { pool }
            | ResilienceError::AcquireTimeout { pool, .. }
            | ResilienceError::PoolClosed { pool } => GatewayError::Unavailable {
                dependency: pool.clone(),
            },
            ResilienceError::RateLimitExceeded { .. } => GatewayError::RateLimited,
            ResilienceError::RetryExhausted { operation, .. } => GatewayError::DependencyFailure {
                dependency: operation.clone(),
            },
            ResilienceError::Rejected(msg) => GatewayError::BadRequest(msg.clone()),
            ResilienceError::Cancelled | ResilienceError::DeadlineExceeded => {
                GatewayError::Timeout
            }
            ResilienceError::InvalidConfig(msg) => GatewayError::Config(msg.clone()),
            ResilienceError::LeaseAlreadyReleased | ResilienceError::ForeignLease => {
                GatewayError::Internal(err.to_string())
            }
            ResilienceError::HealthCheckFailed(_)
            | ResilienceError::Timeout(_)
            | ResilienceError::Transient(_)
            | ResilienceError::Permanent(_)
            | ResilienceError::Connection(_)
            | ResilienceError::ConnectionCreation(_) => GatewayError::DependencyFailure {
                dependency: "upstream".to_string(),
            },
        };

        warn!(
            kind = mapped.kind(),
            status = mapped.status_code(),
            error = %err,
            "request failed"
        );
        mapped
    }
}
