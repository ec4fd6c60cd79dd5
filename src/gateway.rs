/*!
 * Gateway resilience bundle
 *
 * Everything the request path needs to protect downstream calls, built once
 * from `GatewayConfig` at startup and shared by reference: the per-key rate
 * limiter, one circuit breaker per dependency, and the metrics sink all
 * pools report to.
 */

use gatehouse_core_resilience::{
    CallContext, CircuitBreaker, MetricsSink, RateLimiter, ResilienceError, ResourceFactory,
    ResourcePool,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::telemetry::PrometheusMetrics;

/// Rate limiter, breakers and metrics for one gateway instance
#[derive(Debug, Clone)]
pub struct GatewayResilience {
    config: GatewayConfig,
    metrics: Arc<PrometheusMetrics>,
    limiter: RateLimiter,
    breakers: BTreeMap<String, CircuitBreaker>,
    /// Pools built so far per dependency, for distinct metric labels
    pools_built: Arc<BTreeMap<String, AtomicUsize>>,
}

impl GatewayResilience {
    /// Validate `config` and build every shared component
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(PrometheusMetrics::new()?);
        let sink: Arc<dyn MetricsSink> = metrics.clone();

        let limiter = config.rate_limit.build()?.with_metrics(Arc::clone(&sink));

        let mut breakers = BTreeMap::new();
        let mut pools_built = BTreeMap::new();
        for (name, settings) in &config.pools {
            let breaker = CircuitBreaker::new(settings.breaker_config(name))
                .map_err(|e| GatewayError::Config(format!("pools.{}: {}", name, e)))?
                .with_metrics(Arc::clone(&sink));
            breakers.insert(name.clone(), breaker);
            pools_built.insert(name.clone(), AtomicUsize::new(0));
        }

        info!(
            dependencies = breakers.len(),
            rate_capacity = config.rate_limit.capacity,
            rate_refill = config.rate_limit.refill_per_second,
            "gateway resilience initialised"
        );

        Ok(Self {
            config,
            metrics,
            limiter,
            breakers,
            pools_built: Arc::new(pools_built),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PrometheusMetrics> {
        &self.metrics
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Breaker guarding `dependency`, shared by every pool built for it
    pub fn breaker(&self, dependency: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(dependency)
    }

    /// Configured dependency names, sorted
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.breakers.keys().map(String::as_str)
    }

    /// Build the pool for `dependency` around a caller-supplied factory
    ///
    /// The pool is warmed up to the configured `min_idle` before it is
    /// returned; a warm-up failure is logged and the missing handles are
    /// created lazily on acquire. The first pool for a dependency reports
    /// metrics under the dependency name, later ones under `<name>-<n>`.
    pub async fn build_pool<T>(
        &self,
        dependency: &str,
        factory: Arc<dyn ResourceFactory<T>>,
    ) -> Result<ResourcePool<T>>
    where
        T: Send + Sync + 'static,
    {
        let (settings, breaker) = self
            .config
            .pool(dependency)
            .zip(self.breakers.get(dependency))
            .ok_or_else(|| {
                GatewayError::Config(format!("no pool configured for '{}'", dependency))
            })?;

        let mut pool_config = settings.pool_config(dependency);
        let instance = self
            .pools_built
            .get(dependency)
            .map_or(0, |built| built.fetch_add(1, Ordering::Relaxed));
        if instance > 0 {
            pool_config.name = format!("{}-{}", dependency, instance + 1);
        }

        let sink: Arc<dyn MetricsSink> = self.metrics.clone();
        let pool = ResourcePool::builder(factory)
            .config(pool_config)
            .breaker(breaker.clone())
            .retry(settings.retry_policy())
            .metrics(sink)
            .build()
            .map_err(|e| GatewayError::Config(format!("pools.{}: {}", dependency, e)))?;

        match pool.maintain_idle().await {
            Ok(warmed) => debug!(
                dependency,
                pool = pool.name(),
                size = settings.size,
                warmed,
                "built resource pool"
            ),
            Err(e) => warn!(
                dependency,
                pool = pool.name(),
                error = %e,
                "could not warm resource pool, handles will be created on demand"
            ),
        }
        Ok(pool)
    }

    /// Charge one request to `key`, without waiting
    pub fn admit(&self, key: &str) -> Result<()> {
        if self.limiter.allow(key, 1.0) {
            Ok(())
        } else {
            debug!(key, "request rate limited");
            Err(GatewayError::RateLimited)
        }
    }

    /// Admit the request for `key`, then run `op` through `pool`
    ///
    /// Failures come back already mapped to user-facing errors; the full
    /// resilience error is logged on the way.
    pub async fn call<T, F, Fut, R>(
        &self,
        ctx: &CallContext,
        key: &str,
        pool: &ResourcePool<T>,
        op: F,
    ) -> Result<R>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut(T) -> Fut,
        Fut: Future<Output = std::result::Result<R, ResilienceError>>,
    {
        self.admit(key)?;
        Ok(pool.execute(ctx, op).await?)
    }

    /// Get metrics in Prometheus text format
    pub fn metrics_text(&self) -> Result<String> {
        self.metrics.metrics_text()
    }
}
