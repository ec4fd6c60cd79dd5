//! Metrics sink interface
//!
//! The breaker, retry policy, pool and limiter report to an injected
//! [`MetricsSink`]. Exporting (Prometheus or otherwise) is the embedding
//! application's job.

use crate::circuit_breaker::CircuitState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

/// Final outcome of a retried operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryOutcome {
    /// Some attempt succeeded
    Success,
    /// Attempts ran out, or the breaker opened mid-retry
    Exhausted,
}

impl RetryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryOutcome::Success => "success",
            RetryOutcome::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for RetryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer for resilience events
///
/// Implementations must be cheap and non-blocking; they are called from hot
/// paths, sometimes while a pool or breaker lock is held.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    /// Pool gauge: resources by state (`available` / `in_use`)
    fn record_pool_size(&self, pool: &str, available: usize, in_use: usize);

    /// Retry counter, one increment per completed retried operation
    fn record_retry(&self, operation: &str, outcome: RetryOutcome);

    /// Breaker gauge: 1 while open, 0 otherwise
    fn record_breaker_state(&self, operation: &str, state: CircuitState);

    /// Rate limiter rejection counter
    fn record_rate_limited(&self, _key: &str) {}
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_pool_size(&self, _pool: &str, _available: usize, _in_use: usize) {}
    fn record_retry(&self, _operation: &str, _outcome: RetryOutcome) {}
    fn record_breaker_state(&self, _operation: &str, _state: CircuitState) {}
}

/// Sink that keeps the latest values in memory
///
/// Handy for tests and for embedding applications that poll instead of export.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    pools: Mutex<HashMap<String, (usize, usize)>>,
    retries: Mutex<HashMap<(String, RetryOutcome), u64>>,
    breakers: Mutex<HashMap<String, CircuitState>>,
    rate_limited: Mutex<HashMap<String, u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest `(available, in_use)` reported for a pool
    pub fn pool_size(&self, pool: &str) -> Option<(usize, usize)> {
        self.pools.lock().get(pool).copied()
    }

    pub fn retry_count(&self, operation: &str, outcome: RetryOutcome) -> u64 {
        self.retries
            .lock()
            .get(&(operation.to_string(), outcome))
            .copied()
            .unwrap_or(0)
    }

    /// The `circuit_breaker_open` gauge value (0 or 1)
    pub fn breaker_open(&self, operation: &str) -> u8 {
        match self.breakers.lock().get(operation) {
            Some(CircuitState::Open) => 1,
            _ => 0,
        }
    }

    pub fn breaker_state(&self, operation: &str) -> Option<CircuitState> {
        self.breakers.lock().get(operation).copied()
    }

    pub fn rate_limited_count(&self, key: &str) -> u64 {
        self.rate_limited.lock().get(key).copied().unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_pool_size(&self, pool: &str, available: usize, in_use: usize) {
        self.pools
            .lock()
            .insert(pool.to_string(), (available, in_use));
    }

    fn record_retry(&self, operation: &str, outcome: RetryOutcome) {
        *self
            .retries
            .lock()
            .entry((operation.to_string(), outcome))
            .or_insert(0) += 1;
    }

    fn record_breaker_state(&self, operation: &str, state: CircuitState) {
        self.breakers.lock().insert(operation.to_string(), state);
    }

    fn record_rate_limited(&self, key: &str) {
        *self.rate_limited.lock().entry(key.to_string()).or_insert(0) += 1;
    }
}
