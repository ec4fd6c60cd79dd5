//! Rate limiting for preventing dependency overload
//!
//! Token bucket admission control. Each admission key (client, tool, tenant)
//! owns an independent bucket; exhausting one key never affects another.
//! Refill is computed lazily on access, so idle keys cost nothing.

use super::context::CallContext;
use super::error::ResilienceError;
use super::metrics::{MetricsSink, NoopMetrics};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Longest single sleep `wait` schedules; the balance is re-checked after it
const MAX_REFILL_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Costs must be finite and non-negative
fn is_valid_cost(cost: f64) -> bool {
    cost.is_finite() && cost >= 0.0
}

/// Balance and refill timestamp of one bucket
#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket
///
/// Starts full. `refill → check → take` happens under one lock so two
/// callers can never both spend the same tokens.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket holding at most `capacity` tokens, refilled at
    /// `refill_rate` tokens per second
    pub fn new(capacity: f64, refill_rate: f64) -> Result<Self, ResilienceError> {
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(ResilienceError::InvalidConfig(format!(
                "token bucket capacity must be a positive number, got {}",
                capacity
            )));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(ResilienceError::InvalidConfig(format!(
                "token bucket refill rate must be a positive number, got {}",
                refill_rate
            )));
        }
        Ok(Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Current balance after refill
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Take `cost` tokens if the balance covers it
    ///
    /// A negative or non-finite cost is never admitted.
    pub fn try_acquire(&self, cost: f64) -> bool {
        if !is_valid_cost(cost) {
            return false;
        }
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= cost {
            state.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Time until `cost` tokens will be available, `None` if never
    pub fn time_until_available(&self, cost: f64) -> Option<Duration> {
        if !is_valid_cost(cost) || cost > self.capacity {
            return None;
        }
        let mut state = self.state.lock();
        self.refill(&mut state);
        let missing = cost - state.tokens;
        if missing <= 0.0 {
            Some(Duration::ZERO)
        } else {
            let wait = Duration::try_from_secs_f64(missing / self.refill_rate)
                .unwrap_or(MAX_REFILL_WAIT);
            Some(wait.min(MAX_REFILL_WAIT))
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }
}

/// Keyed token bucket rate limiter
///
/// Buckets are created lazily on a key's first use and live for the
/// limiter's lifetime. Lookups go through DashMap shards; the refill-and-take
/// itself locks only that key's bucket.
///
/// # Example
/// ```no_run
/// use gatehouse_core_resilience::{CallContext, RateLimiter, ResilienceError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     // Bursts of 10, sustained 5 requests per second per key
///     let limiter = RateLimiter::new(10.0, 5.0)?;
///
///     if limiter.allow("tenant-a", 1.0) {
///         // admitted
///     }
///
///     // Block until a token is available or the context expires
///     limiter.wait(&CallContext::new(), "tenant-b", 1.0).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RateLimiter {
    capacity: f64,
    refill_rate: f64,
    buckets: Arc<DashMap<String, Arc<TokenBucket>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl RateLimiter {
    /// Create a limiter whose per-key buckets hold `capacity` tokens and
    /// refill at `refill_per_second`
    pub fn new(capacity: f64, refill_per_second: f64) -> Result<Self, ResilienceError> {
        // Validate once up front so bucket creation on the hot path cannot fail
        TokenBucket::new(capacity, refill_per_second)?;
        Ok(Self {
            capacity,
            refill_rate: refill_per_second,
            buckets: Arc::new(DashMap::new()),
            metrics: Arc::new(NoopMetrics),
        })
    }

    /// Create a rate limiter allowing `requests_per_second` with an equal burst
    pub fn per_second(requests_per_second: u32) -> Result<Self, ResilienceError> {
        Self::new(requests_per_second as f64, requests_per_second as f64)
    }

    /// Create a rate limiter allowing `requests_per_minute` with an equal burst
    pub fn per_minute(requests_per_minute: u32) -> Result<Self, ResilienceError> {
        Self::new(requests_per_minute as f64, requests_per_minute as f64 / 60.0)
    }

    /// Report rejections to `metrics`
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Number of keys that have a bucket
    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    /// Current balance for `key` (a full bucket for unseen keys)
    pub fn tokens(&self, key: &str) -> f64 {
        match self.buckets.get(key) {
            Some(bucket) => bucket.available(),
            None => self.capacity,
        }
    }

    /// Admit a call costing `cost` tokens for `key` without waiting
    pub fn allow(&self, key: &str, cost: f64) -> bool {
        if !is_valid_cost(cost) {
            debug!(key, cost, "refusing call with invalid cost");
            return false;
        }
        let allowed = self.bucket(key).try_acquire(cost);
        if !allowed {
            trace!(key, cost, "rate limit rejected call");
            self.metrics.record_rate_limited(key);
        }
        allowed
    }

    /// Wait until `cost` tokens are available for `key`
    ///
    /// Returns `Cancelled` / `DeadlineExceeded` if `ctx` ends the wait first,
    /// and `InvalidConfig` if `cost` is negative, not finite or exceeds the
    /// bucket capacity.
    pub async fn wait(
        &self,
        ctx: &CallContext,
        key: &str,
        cost: f64,
    ) -> Result<(), ResilienceError> {
        if !is_valid_cost(cost) {
            return Err(ResilienceError::InvalidConfig(format!(
                "rate limiter cost must be a non-negative number, got {}",
                cost
            )));
        }
        let bucket = self.bucket(key);

        loop {
            if bucket.try_acquire(cost) {
                return Ok(());
            }
            let delay = bucket.time_until_available(cost).ok_or_else(|| {
                ResilienceError::InvalidConfig(format!(
                    "cost {} exceeds rate limiter capacity {}",
                    cost, self.capacity
                ))
            })?;
            debug!(key, cost, ?delay, "waiting for rate limit tokens");
            // Another waiter may take the tokens first; loop re-checks
            ctx.sleep(delay.max(Duration::from_millis(1))).await?;
        }
    }

    /// Wait for a token, then execute the operation
    pub async fn execute<F, Fut, T>(
        &self,
        ctx: &CallContext,
        key: &str,
        op: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        self.wait(ctx, key, 1.0).await?;
        op().await
    }

    /// Try to execute an operation without waiting
    ///
    /// Returns `RateLimitExceeded` if the key has no token left.
    pub async fn try_execute<F, Fut, T>(&self, key: &str, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        if !self.allow(key, 1.0) {
            return Err(ResilienceError::RateLimitExceeded {
                key: key.to_string(),
            });
        }
        op().await
    }

    fn bucket(&self, key: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(TokenBucket {
                    capacity: self.capacity,
                    refill_rate: self.refill_rate,
                    state: Mutex::new(BucketState {
                        tokens: self.capacity,
                        last_refill: Instant::now(),
                    }),
                })
            });
        Arc::clone(bucket.value())
    }
}

/// Keyed rate limiter backed by the governor crate (when feature is enabled)
///
/// GCRA instead of a float balance; useful when integer costs are enough.
#[cfg(feature = "governor-impl")]
pub mod governor_impl {
    use super::*;
    use governor::{DefaultKeyedRateLimiter, Quota};
    use std::num::NonZeroU32;

    /// Rate limiter wrapper using governor
    pub struct GovernorRateLimiter {
        limiter: Arc<DefaultKeyedRateLimiter<String>>,
    }

    impl GovernorRateLimiter {
        /// Create a keyed limiter allowing `burst` calls, replenished at
        /// `per_second` calls per second
        pub fn new(burst: u32, per_second: u32) -> Result<Self, ResilienceError> {
            let burst = NonZeroU32::new(burst)
                .ok_or_else(|| ResilienceError::InvalidConfig("burst must be > 0".to_string()))?;
            let per_second = NonZeroU32::new(per_second).ok_or_else(|| {
                ResilienceError::InvalidConfig("per_second must be > 0".to_string())
            })?;

            let quota = Quota::per_second(per_second).allow_burst(burst);
            Ok(Self {
                limiter: Arc::new(governor::RateLimiter::keyed(quota)),
            })
        }

        /// Admit one call for `key` without waiting
        pub fn allow(&self, key: &str) -> bool {
            self.limiter.check_key(&key.to_string()).is_ok()
        }

        /// Wait for a permit for `key`, honouring `ctx`
        pub async fn wait(&self, ctx: &CallContext, key: &str) -> Result<(), ResilienceError> {
            let key = key.to_string();
            ctx.run(self.limiter.until_key_ready(&key)).await
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_governor_burst() {
            let limiter = GovernorRateLimiter::new(2, 1).unwrap();
            assert!(limiter.allow("a"));
            assert!(limiter.allow("a"));
            assert!(!limiter.allow("a"));
            assert!(limiter.allow("b"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let limiter = RateLimiter::new(10.0, 5.0).unwrap();

        for _ in 0..10 {
            assert!(limiter.allow("client", 1.0));
        }
        assert!(!limiter.allow("client", 1.0));

        tokio::time::advance(Duration::from_secs(1)).await;

        let admitted = (0..10).filter(|_| limiter.allow("client", 1.0)).count();
        assert_eq!(admitted, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_isolated() {
        let limiter = RateLimiter::new(2.0, 1.0).unwrap();
        assert!(limiter.allow("a", 2.0));
        assert!(!limiter.allow("a", 1.0));

        assert!(limiter.allow("b", 1.0));
        assert!(limiter.allow("b", 1.0));
        assert_eq!(limiter.key_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_never_exceed_capacity() {
        let limiter = RateLimiter::new(3.0, 100.0).unwrap();
        assert!(limiter.allow("k", 1.0));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.tokens("k"), 3.0);
        assert_eq!(limiter.tokens("unseen"), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_until_refill() {
        let limiter = RateLimiter::new(1.0, 2.0).unwrap();
        let ctx = CallContext::new();
        limiter.wait(&ctx, "k", 1.0).await.unwrap();

        let start = Instant::now();
        limiter.wait(&ctx, "k", 1.0).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_honours_deadline() {
        let limiter = RateLimiter::new(1.0, 0.1).unwrap();
        assert!(limiter.allow("k", 1.0));

        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        let err = limiter.wait(&ctx, "k", 1.0).await.unwrap_err();
        assert!(matches!(err, ResilienceError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_cost_above_capacity() {
        let limiter = RateLimiter::new(2.0, 1.0).unwrap();
        assert!(!limiter.allow("k", 5.0));
        let err = limiter
            .wait(&CallContext::new(), "k", 5.0)
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_invalid_cost_is_refused() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let limiter = RateLimiter::new(2.0, 1.0)
            .unwrap()
            .with_metrics(metrics.clone());

        assert!(!limiter.allow("k", -5.0));
        assert!(!limiter.allow("k", f64::NAN));
        assert!(!limiter.allow("k", f64::INFINITY));
        assert!(limiter.tokens("k") <= limiter.capacity());
        assert_eq!(metrics.rate_limited_count("k"), 0);

        for cost in [f64::NAN, -1.0, f64::INFINITY] {
            let err = limiter
                .wait(&CallContext::new(), "k", cost)
                .await
                .unwrap_err();
            assert!(matches!(err, ResilienceError::InvalidConfig(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_refill_rate_waits_without_overflow() {
        let bucket = TokenBucket::new(1.0, 1e-300).unwrap();
        assert!(bucket.try_acquire(1.0));
        assert_eq!(bucket.time_until_available(1.0), Some(MAX_REFILL_WAIT));

        let limiter = RateLimiter::new(1.0, 1e-300).unwrap();
        assert!(limiter.allow("k", 1.0));
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        let err = limiter.wait(&ctx, "k", 1.0).await.unwrap_err();
        assert!(matches!(err, ResilienceError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_try_execute_rejects_when_empty() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let limiter = RateLimiter::per_second(1)
            .unwrap()
            .with_metrics(metrics.clone());

        let first = limiter
            .try_execute("tool", || async { Ok::<_, ResilienceError>(42) })
            .await;
        assert_eq!(first.unwrap(), 42);

        let second = limiter
            .try_execute("tool", || async { Ok::<_, ResilienceError>(42) })
            .await;
        assert!(matches!(second, Err(ResilienceError::RateLimitExceeded { .. })));
        assert_eq!(metrics.rate_limited_count("tool"), 1);
    }

    #[test]
    fn test_rate_limiter_config() {
        let limiter = RateLimiter::per_second(100).unwrap();
        assert_eq!(limiter.capacity(), 100.0);
        assert_eq!(limiter.refill_rate(), 100.0);

        let limiter = RateLimiter::per_minute(60).unwrap();
        assert_eq!(limiter.refill_rate(), 1.0);

        assert!(RateLimiter::new(0.0, 1.0).is_err());
        assert!(RateLimiter::new(1.0, f64::NAN).is_err());
    }
}
