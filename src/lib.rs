/*!
 * Gatehouse - resilience layer for an AI orchestration gateway
 *
 * Wires the resilience core into a gateway process:
 * - Validated TOML configuration, one section per downstream dependency
 * - Structured logging (compact stdout or JSON file)
 * - Prometheus metrics for pools, retries, breakers and rate limits
 * - An explicitly constructed bundle of limiter, breakers and pools
 * - User-facing error mapping with HTTP status semantics
 */

pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod telemetry;

// Re-export commonly used types
pub use config::{GatewayConfig, LogLevel, LoggingConfig, PoolSettings, RateLimitConfig};
pub use error::{GatewayError, Result};
pub use gateway::GatewayResilience;
pub use telemetry::PrometheusMetrics;

pub use gatehouse_core_resilience as resilience;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
