//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a
//! dependency is experiencing issues. It has three states:
//! - Closed: Normal operation, calls pass through and failures are counted
//! - Open: Dependency is unhealthy, calls fail immediately
//! - HalfOpen: A single trial call is testing whether the dependency recovered
//!
//! Legal transitions are Closed→Open, Open→HalfOpen, HalfOpen→Closed and
//! HalfOpen→Open. An Open breaker never closes without a successful trial.

use super::error::ResilienceError;
use super::metrics::{MetricsSink, NoopMetrics};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed, calls pass through normally
    Closed,
    /// Circuit is open, calls fail immediately
    Open,
    /// Circuit is half-open, one trial call is admitted
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Name of the guarded operation type, used in errors, logs and metrics
    pub name: String,
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Duration an open circuit waits before admitting a trial call
    pub reset_timeout: Duration,
    /// Upper bound on a single guarded call; elapsing counts as a failure
    pub call_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            call_timeout: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Reject values that would make the breaker meaningless
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::InvalidConfig(format!(
                "circuit breaker '{}': failure_threshold must be at least 1",
                self.name
            )));
        }
        if self.reset_timeout.is_zero() {
            return Err(ResilienceError::InvalidConfig(format!(
                "circuit breaker '{}': reset_timeout must be greater than zero",
                self.name
            )));
        }
        if self.call_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ResilienceError::InvalidConfig(format!(
                "circuit breaker '{}': call_timeout must be greater than zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// Internal state of the circuit breaker, guarded by one mutex
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// A HalfOpen trial has been admitted and not yet settled
    trial_in_flight: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

/// How a call was let through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Admitted while Closed
    Normal,
    /// The single HalfOpen probe
    Trial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// Error that says nothing about the dependency's health
    Neutral,
}

/// Circuit breaker for protecting against cascading failures
///
/// Cloning is cheap and shares state: every clone guards the same operation type.
///
/// # Example
/// ```no_run
/// use gatehouse_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     let breaker = CircuitBreaker::new(CircuitBreakerConfig {
///         name: "vector-search".to_string(),
///         failure_threshold: 5,
///         reset_timeout: Duration::from_secs(30),
///         ..Default::default()
///     })?;
///
///     let hits = breaker.call(|| async { Ok::<_, ResilienceError>(vec![0.9_f32]) }).await?;
///     println!("hits: {:?}", hits);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<BreakerState>>,
    metrics: Arc<dyn MetricsSink>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(BreakerState::new())),
            metrics: Arc::new(NoopMetrics),
        })
    }

    /// Create a breaker from the two knobs that matter most
    pub fn with_threshold(
        name: impl Into<String>,
        failure_threshold: u32,
        reset_timeout: Duration,
    ) -> Result<Self, ResilienceError> {
        Self::new(CircuitBreakerConfig {
            name: name.into(),
            failure_threshold,
            reset_timeout,
            call_timeout: None,
        })
    }

    /// Report state changes to `metrics`
    ///
    /// Call before cloning the breaker; clones made earlier keep their sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        metrics.record_breaker_state(&self.config.name, self.state());
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker
    ///
    /// An Open breaker whose reset timeout has elapsed still reports `Open`
    /// until the next call is admitted as the HalfOpen trial.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Get current consecutive failure count
    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// When the breaker last opened, if it is currently open or half-open
    pub fn opened_at(&self) -> Option<Instant> {
        self.state.lock().opened_at
    }

    /// Force the circuit back to closed state
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.trial_in_flight = false;
        if state.state != CircuitState::Closed {
            info!(breaker = %self.config.name, from = %state.state, "circuit breaker manually reset");
            self.close(&mut state);
        } else {
            state.consecutive_failures = 0;
        }
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// Returns `CircuitOpen` without running `op` while the circuit is open or
    /// while another caller holds the HalfOpen trial. Errors for which
    /// [`ResilienceError::should_trip_breaker`] is true count as failures, as
    /// does a `call_timeout` expiry or dropping the returned future mid-call.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let admission = self.admit()?;
        let mut guard = CallGuard {
            breaker: self,
            admission,
            settled: false,
        };

        let result = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(result) => result,
                Err(_) => Err(ResilienceError::Timeout(limit)),
            },
            None => op().await,
        };

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(e) if e.should_trip_breaker() => Outcome::Failure,
            Err(_) => Outcome::Neutral,
        };
        guard.settle(outcome);

        result
    }

    /// Decide whether a call may proceed, moving Open→HalfOpen when due
    fn admit(&self) -> Result<Admission, ResilienceError> {
        let mut state = self.state.lock();

        match state.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let now = Instant::now();
                let due = state
                    .opened_at
                    .map_or(true, |opened| now >= opened + self.config.reset_timeout);
                if due {
                    self.transition(&mut state, CircuitState::HalfOpen);
                    state.trial_in_flight = true;
                    debug!(breaker = %self.config.name, "admitting half-open trial call");
                    Ok(Admission::Trial)
                } else {
                    Err(self.open_error())
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    Err(self.open_error())
                } else {
                    state.trial_in_flight = true;
                    debug!(breaker = %self.config.name, "admitting half-open trial call");
                    Ok(Admission::Trial)
                }
            }
        }
    }

    fn on_outcome(&self, admission: Admission, outcome: Outcome) {
        let mut state = self.state.lock();

        match admission {
            Admission::Normal => {
                // Results of calls that started before the circuit opened are stale
                if state.state != CircuitState::Closed {
                    return;
                }
                match outcome {
                    Outcome::Success => state.consecutive_failures = 0,
                    Outcome::Failure => {
                        state.consecutive_failures += 1;
                        if state.consecutive_failures >= self.config.failure_threshold {
                            self.open(&mut state);
                        }
                    }
                    Outcome::Neutral => {}
                }
            }
            Admission::Trial => {
                state.trial_in_flight = false;
                if state.state != CircuitState::HalfOpen {
                    return;
                }
                match outcome {
                    Outcome::Success => self.close(&mut state),
                    Outcome::Failure => self.open(&mut state),
                    Outcome::Neutral => {
                        debug!(breaker = %self.config.name, "half-open trial ended without a verdict");
                    }
                }
            }
        }
    }

    fn open(&self, state: &mut BreakerState) {
        state.opened_at = Some(Instant::now());
        warn!(
            breaker = %self.config.name,
            failures = state.consecutive_failures,
            reset_timeout = ?self.config.reset_timeout,
            "circuit breaker opened"
        );
        self.transition(state, CircuitState::Open);
    }

    fn close(&self, state: &mut BreakerState) {
        state.consecutive_failures = 0;
        state.opened_at = None;
        info!(breaker = %self.config.name, "circuit breaker closed");
        self.transition(state, CircuitState::Closed);
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        state.state = to;
        self.metrics.record_breaker_state(&self.config.name, to);
    }

    fn open_error(&self) -> ResilienceError {
        ResilienceError::CircuitOpen {
            name: self.config.name.clone(),
        }
    }
}

/// Settles an admitted call exactly once, counting an abandoned call as a failure
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl CallGuard<'_> {
    fn settle(&mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.on_outcome(self.admission, outcome);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(breaker = %self.breaker.config.name, "guarded call dropped before completion");
            self.breaker.on_outcome(self.admission, Outcome::Failure);
        }
    }
}
