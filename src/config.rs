/*!
 * Gateway configuration
 *
 * Loaded once at startup from a TOML file, validated, and turned into the
 * resilience core's own config types. Unknown keys are rejected so a typo in
 * a threshold fails loudly instead of silently falling back to a default.
 */

use gatehouse_core_resilience::{
    CircuitBreakerConfig, HealthCheckPolicy, PoolConfig, RateLimiter, ResilienceError,
    RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Diagnostic output
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-key request quota
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// One pool (with its breaker and retry policy) per downstream dependency
    #[serde(default)]
    pub pools: BTreeMap<String, PoolSettings>,
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout); file output is JSON
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Token bucket shared by every key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Burst size in tokens
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    /// Tokens added per second
    #[serde(default = "default_refill_per_second")]
    pub refill_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_second: default_refill_per_second(),
        }
    }
}

impl RateLimitConfig {
    pub fn build(&self) -> Result<RateLimiter> {
        RateLimiter::new(self.capacity, self.refill_per_second).map_err(config_error("rate_limit"))
    }
}

/// How pooled handles are probed before hand-out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckMode {
    #[default]
    Always,
    Never,
    /// Only after `health_check_after_idle_ms` of idleness
    AfterIdle,
}

/// Settings for one downstream dependency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    /// Maximum number of pooled handles
    #[serde(default = "default_pool_size")]
    pub size: usize,

    #[serde(default)]
    pub min_idle: usize,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    #[serde(default)]
    pub health_check: HealthCheckMode,

    #[serde(default = "default_health_check_after_idle_ms")]
    pub health_check_after_idle_ms: u64,

    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,

    #[serde(default)]
    pub max_lifetime_ms: Option<u64>,

    /// Consecutive failures before the breaker opens
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    #[serde(default = "default_breaker_reset_timeout_ms")]
    pub breaker_reset_timeout_ms: u64,

    /// Per-call limit enforced by the breaker; a timeout counts as a failure
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,

    /// Total attempts, including the first
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            min_idle: 0,
            acquire_timeout_ms: default_acquire_timeout_ms(),
            health_check: HealthCheckMode::default(),
            health_check_after_idle_ms: default_health_check_after_idle_ms(),
            idle_timeout_ms: None,
            max_lifetime_ms: None,
            breaker_threshold: default_breaker_threshold(),
            breaker_reset_timeout_ms: default_breaker_reset_timeout_ms(),
            call_timeout_ms: None,
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_multiplier: default_retry_multiplier(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl PoolSettings {
    pub fn pool_config(&self, name: &str) -> PoolConfig {
        PoolConfig {
            name: name.to_string(),
            max_size: self.size,
            min_idle: self.min_idle,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            idle_timeout: self.idle_timeout_ms.map(Duration::from_millis),
            max_lifetime: self.max_lifetime_ms.map(Duration::from_millis),
            health_check: match self.health_check {
                HealthCheckMode::Always => HealthCheckPolicy::Always,
                HealthCheckMode::Never => HealthCheckPolicy::Never,
                HealthCheckMode::AfterIdle => HealthCheckPolicy::AfterIdle(Duration::from_millis(
                    self.health_check_after_idle_ms,
                )),
            },
        }
    }

    pub fn breaker_config(&self, name: &str) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            name: name.to_string(),
            failure_threshold: self.breaker_threshold,
            reset_timeout: Duration::from_millis(self.breaker_reset_timeout_ms),
            call_timeout: self.call_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            multiplier: self.retry_multiplier,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    /// Validate the settings of the pool called `name`
    pub fn validate(&self, name: &str) -> Result<()> {
        let section = format!("pools.{}", name);
        self.pool_config(name)
            .validate()
            .map_err(config_error(&section))?;
        self.breaker_config(name)
            .validate()
            .map_err(config_error(&section))?;
        self.retry_policy()
            .validate()
            .map_err(config_error(&section))?;
        if self.call_timeout_ms == Some(0) {
            return Err(GatewayError::Config(format!(
                "{}: call_timeout_ms must be greater than 0",
                section
            )));
        }
        Ok(())
    }
}

impl GatewayConfig {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: GatewayConfig = toml::from_str(contents)
            .map_err(|e| GatewayError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section, failing on the first out-of-range value
    pub fn validate(&self) -> Result<()> {
        self.rate_limit.build()?;
        for (name, pool) in &self.pools {
            if name.trim().is_empty() {
                return Err(GatewayError::Config(
                    "pool names must not be empty".to_string(),
                ));
            }
            pool.validate(name)?;
        }
        Ok(())
    }

    pub fn pool(&self, name: &str) -> Option<&PoolSettings> {
        self.pools.get(name)
    }
}

fn config_error(section: &str) -> impl Fn(ResilienceError) -> GatewayError + '_ {
    move |e| match e {
        ResilienceError::InvalidConfig(msg) => GatewayError::Config(format!("{}: {}", section, msg)),
        other => GatewayError::Config(format!("{}: {}", section, other)),
    }
}

// Default value functions for serde
fn default_capacity() -> f64 {
    10.0
}

fn default_refill_per_second() -> f64 {
    5.0
}

fn default_pool_size() -> usize {
    8
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_health_check_after_idle_ms() -> u64 {
    30_000
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_reset_timeout_ms() -> u64 {
    30_000
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[logging]
level = "debug"

[rate_limit]
capacity = 20
refill_per_second = 2.5

[pools.completions]
size = 4
acquire_timeout_ms = 250
health_check = "after_idle"
health_check_after_idle_ms = 1000
breaker_threshold = 3
breaker_reset_timeout_ms = 10000
call_timeout_ms = 2000
retry_max_attempts = 4
retry_base_delay_ms = 50

[pools.embeddings]
health_check = "never"
"#;

    #[test]
    fn test_parse_sample() {
        let config = GatewayConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.rate_limit.capacity, 20.0);
        assert_eq!(config.pools.len(), 2);

        let completions = config.pool("completions").unwrap();
        let pool = completions.pool_config("completions");
        assert_eq!(pool.max_size, 4);
        assert_eq!(pool.acquire_timeout, Duration::from_millis(250));
        assert_eq!(
            pool.health_check,
            HealthCheckPolicy::AfterIdle(Duration::from_secs(1))
        );

        let breaker = completions.breaker_config("completions");
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(breaker.reset_timeout, Duration::from_secs(10));
        assert_eq!(breaker.call_timeout, Some(Duration::from_secs(2)));

        let retry = completions.retry_policy();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.base_delay, Duration::from_millis(50));
        assert_eq!(retry.multiplier, 2.0);
    }

    #[test]
    fn test_defaults_apply() {
        let config = GatewayConfig::from_toml_str(SAMPLE).unwrap();
        let embeddings = config.pool("embeddings").unwrap();
        assert_eq!(embeddings.size, default_pool_size());
        assert_eq!(embeddings.breaker_threshold, 5);
        assert_eq!(
            embeddings.pool_config("embeddings").health_check,
            HealthCheckPolicy::Never
        );
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = GatewayConfig::from_toml_str("").unwrap();
        assert_eq!(config, GatewayConfig::default());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = GatewayConfig::from_toml_str("[pools.search]\nbreaker_treshold = 3\n");
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        for bad in [
            "[rate_limit]\ncapacity = 0\n",
            "[rate_limit]\nrefill_per_second = -1\n",
            "[pools.search]\nsize = 0\n",
            "[pools.search]\nbreaker_threshold = 0\n",
            "[pools.search]\nretry_max_attempts = 0\n",
            "[pools.search]\nretry_multiplier = 0.5\n",
            "[pools.search]\ncall_timeout_ms = 0\n",
            "[pools.search]\nsize = 2\nmin_idle = 3\n",
        ] {
            let result = GatewayConfig::from_toml_str(bad);
            assert!(
                matches!(result, Err(GatewayError::Config(_))),
                "accepted: {}",
                bad
            );
        }
    }

    #[test]
    fn test_error_names_the_section() {
        let err = GatewayConfig::from_toml_str("[pools.search]\nsize = 0\n").unwrap_err();
        assert!(err.to_string().contains("pools.search"));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert!(config.pool("completions").is_some());
    }

    #[test]
    fn test_missing_file() {
        let result = GatewayConfig::from_file(Path::new("/nonexistent/gatehouse.toml"));
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = GatewayConfig::from_toml_str(SAMPLE).unwrap();
        let text = toml::to_string(&config).unwrap();
        assert_eq!(GatewayConfig::from_toml_str(&text).unwrap(), config);
    }
}
