//! Gatehouse Core Resilience: fault tolerance primitives for downstream calls
//!
//! # Overview
//!
//! This crate provides the building blocks a gateway needs to keep calling
//! flaky dependencies (model backends, vector stores, embedding services)
//! without amplifying their failures. It includes:
//!
//! - **Resource Pool**: Bounded, FIFO-fair reuse of client handles with health checking
//! - **Circuit Breaker**: Fails fast once a dependency looks unhealthy, probes with a single trial
//! - **Retry Policy**: Bounded exponential backoff that stops as soon as the breaker opens
//! - **Rate Limiter**: Per-key token buckets for tenant and user quotas
//! - **Call Context**: Deadline and cancellation carried through every blocking step
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Wire protocols (HTTP, gRPC)
//! - Specific providers or their client libraries
//! - Metrics exporters (everything reports to a [`MetricsSink`])
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Request Handler                 │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter                      │  ← Per-tenant quota
//! │  (Token bucket per key)                 │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Resource Pool                     │  ← Bounded handles
//! │  (FIFO wait, health check, replace)     │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Retry Policy                      │  ← Exponential backoff
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (Closed → Open → HalfOpen trial)       │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!      Downstream Dependency
//!   (LLM provider, vector store, ...)
//! ```
//!
//! # Usage Example
//!
//! ## Basic Circuit Breaker
//!
//! ```no_run
//! use gatehouse_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig {
//!     name: "completions".to_string(),
//!     failure_threshold: 5,
//!     reset_timeout: Duration::from_secs(30),
//!     ..Default::default()
//! })?;
//!
//! let result = breaker
//!     .call(|| async {
//!         // Your potentially failing operation
//!         Ok::<_, ResilienceError>(42)
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Resource Pool
//!
//! ```no_run
//! use gatehouse_core_resilience::{
//!     CallContext, PoolConfig, ResilienceError, ResourceFactory, ResourcePool,
//! };
//! use std::sync::Arc;
//!
//! # #[derive(Clone)]
//! # struct VectorStoreClient;
//! struct VectorStoreFactory;
//!
//! #[async_trait::async_trait]
//! impl ResourceFactory<VectorStoreClient> for VectorStoreFactory {
//!     async fn create(&self) -> Result<VectorStoreClient, ResilienceError> {
//!         // Open your client
//! #       Ok(VectorStoreClient)
//!     }
//!
//!     async fn is_healthy(&self, _client: &VectorStoreClient) -> bool {
//!         // Cheap ping
//!         true
//!     }
//! }
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let pool = ResourcePool::new(Arc::new(VectorStoreFactory), PoolConfig::default())?;
//! let ctx = CallContext::with_timeout(std::time::Duration::from_secs(5));
//!
//! let mut lease = pool.acquire(&ctx).await?;
//! // Use lease.handle()...
//! pool.release(&mut lease, true).await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod context;
pub mod error;
pub mod metrics;
pub mod rate_limiter;
pub mod resource_pool;
pub mod retry;

// Re-export main types for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use context::CallContext;
pub use error::ResilienceError;
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics, RetryOutcome};
pub use rate_limiter::{RateLimiter, TokenBucket};
pub use resource_pool::{
    FnFactory, HealthCheckPolicy, Lease, PoolBuilder, PoolConfig, PoolOptions, PoolStats,
    ResourceFactory, ResourcePool,
};
pub use retry::RetryPolicy;

#[cfg(feature = "governor-impl")]
pub use rate_limiter::governor_impl::GovernorRateLimiter;

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use gatehouse_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::context::CallContext;
    pub use super::error::ResilienceError;
    pub use super::metrics::MetricsSink;
    pub use super::rate_limiter::RateLimiter;
    pub use super::resource_pool::{
        HealthCheckPolicy, Lease, PoolConfig, ResourceFactory, ResourcePool,
    };
    pub use super::retry::RetryPolicy;
}
