/*!
 * Prometheus metrics sink
 *
 * Implements the resilience core's `MetricsSink` on top of a private
 * `prometheus::Registry`, so several gateways (or tests) can live in one
 * process without sharing counters.
 */

use gatehouse_core_resilience::{CircuitState, MetricsSink, RetryOutcome};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::fmt;

use crate::error::{GatewayError, Result};

/// Prometheus-backed metrics for pools, retries, breakers and rate limits
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    pool_resources: IntGaugeVec,
    retries_total: IntCounterVec,
    circuit_breaker_open: IntGaugeVec,
    rate_limit_rejections_total: IntCounterVec,
}

impl PrometheusMetrics {
    /// Create the metric families and register them with a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let pool_resources = IntGaugeVec::new(
            Opts::new(
                "gatehouse_pool_resources",
                "Pooled resources by state (available, in_use)",
            ),
            &["pool", "state"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(pool_resources.clone()))
            .map_err(metrics_error)?;

        let retries_total = IntCounterVec::new(
            Opts::new(
                "gatehouse_retries_total",
                "Retried operations by final outcome (success, exhausted)",
            ),
            &["operation", "outcome"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(retries_total.clone()))
            .map_err(metrics_error)?;

        let circuit_breaker_open = IntGaugeVec::new(
            Opts::new(
                "gatehouse_circuit_breaker_open",
                "1 while the circuit breaker for an operation is open",
            ),
            &["operation"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(circuit_breaker_open.clone()))
            .map_err(metrics_error)?;

        let rate_limit_rejections_total = IntCounterVec::new(
            Opts::new(
                "gatehouse_rate_limit_rejections_total",
                "Requests rejected by the rate limiter",
            ),
            &["key"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(rate_limit_rejections_total.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            pool_resources,
            retries_total,
            circuit_breaker_open,
            rate_limit_rejections_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Get metrics in Prometheus text format
    pub fn metrics_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| GatewayError::Internal(e.to_string()))
    }
}

impl fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_pool_size(&self, pool: &str, available: usize, in_use: usize) {
        self.pool_resources
            .with_label_values(&[pool, "available"])
            .set(available as i64);
        self.pool_resources
            .with_label_values(&[pool, "in_use"])
            .set(in_use as i64);
    }

    fn record_retry(&self, operation: &str, outcome: RetryOutcome) {
        self.retries_total
            .with_label_values(&[operation, outcome.as_str()])
            .inc();
    }

    fn record_breaker_state(&self, operation: &str, state: CircuitState) {
        self.circuit_breaker_open
            .with_label_values(&[operation])
            .set(i64::from(state.is_open()));
    }

    fn record_rate_limited(&self, key: &str) {
        self.rate_limit_rejections_total
            .with_label_values(&[key])
            .inc();
    }
}

fn metrics_error(e: prometheus::Error) -> GatewayError {
    GatewayError::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_independent() {
        let a = PrometheusMetrics::new().unwrap();
        let b = PrometheusMetrics::new().unwrap();

        a.record_retry("completions", RetryOutcome::Success);

        assert_eq!(
            a.retries_total
                .with_label_values(&["completions", "success"])
                .get(),
            1
        );
        assert_eq!(
            b.retries_total
                .with_label_values(&["completions", "success"])
                .get(),
            0
        );
    }

    #[test]
    fn test_pool_gauge() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.record_pool_size("search", 3, 1);

        let text = metrics.metrics_text().unwrap();
        assert!(text.contains(r#"gatehouse_pool_resources{pool="search",state="available"} 3"#));
        assert!(text.contains(r#"gatehouse_pool_resources{pool="search",state="in_use"} 1"#));
    }

    #[test]
    fn test_breaker_gauge_follows_state() {
        let metrics = PrometheusMetrics::new().unwrap();

        metrics.record_breaker_state("embeddings", CircuitState::Open);
        assert_eq!(
            metrics
                .circuit_breaker_open
                .with_label_values(&["embeddings"])
                .get(),
            1
        );

        metrics.record_breaker_state("embeddings", CircuitState::HalfOpen);
        assert_eq!(
            metrics
                .circuit_breaker_open
                .with_label_values(&["embeddings"])
                .get(),
            0
        );
    }

    #[test]
    fn test_rate_limit_counter() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.record_rate_limited("tenant-a");
        metrics.record_rate_limited("tenant-a");

        let text = metrics.metrics_text().unwrap();
        assert!(text.contains(r#"gatehouse_rate_limit_rejections_total{key="tenant-a"} 2"#));
    }
}
