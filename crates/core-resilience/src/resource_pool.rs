//! Generic resource pool with guarded execution
//!
//! Manages a bounded set of reusable client handles to one downstream
//! dependency (a vector-store connection, a model backend client, ...).
//!
//! - Waiters queue FIFO on a fair semaphore and give up after
//!   `acquire_timeout` or when their [`CallContext`] ends.
//! - Handles are optionally health-checked before being handed out; a
//!   failed check replaces the handle transparently.
//! - [`ResourcePool::execute`] composes acquire, retry, circuit breaker and
//!   release into one call.
//! - A [`Lease`] always goes back to its pool exactly once, including when
//!   the caller panics or is cancelled.
//!
//! `available + in_use <= max_size` holds whenever the pool lock is released.

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::context::CallContext;
use super::error::ResilienceError;
use super::metrics::{MetricsSink, NoopMetrics};
use super::retry::RetryPolicy;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// When to probe a pooled handle before handing it out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthCheckPolicy {
    /// Probe on every acquire
    #[default]
    Always,
    /// Never probe; for latency-sensitive call sites
    Never,
    /// Probe only handles that sat idle at least this long
    AfterIdle(Duration),
}

/// Configuration for resource pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool name, used in errors, logs and metrics
    pub name: String,
    /// Maximum number of resources held at once (idle + leased)
    pub max_size: usize,
    /// Number of idle resources [`ResourcePool::maintain_idle`] keeps warm
    pub min_idle: usize,
    /// Timeout for acquiring a resource from the pool
    pub acquire_timeout: Duration,
    /// Maximum time a resource can remain idle before being destroyed
    pub idle_timeout: Option<Duration>,
    /// Maximum lifetime of a resource
    pub max_lifetime: Option<Duration>,
    /// Liveness probing before hand-out
    pub health_check: HealthCheckPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            max_size: 10,
            min_idle: 0,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(300)),  // 5 minutes
            max_lifetime: Some(Duration::from_secs(1800)), // 30 minutes
            health_check: HealthCheckPolicy::Always,
        }
    }
}

impl PoolConfig {
    /// Validate pool configuration, returning an error if invalid
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_size == 0 {
            return Err(ResilienceError::InvalidConfig(format!(
                "pool '{}': max_size must be greater than 0",
                self.name
            )));
        }
        if self.min_idle > self.max_size {
            return Err(ResilienceError::InvalidConfig(format!(
                "pool '{}': min_idle ({}) must not exceed max_size ({})",
                self.name, self.min_idle, self.max_size
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(ResilienceError::InvalidConfig(format!(
                "pool '{}': acquire_timeout must be greater than zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// The minimal option set accepted by [`ResourcePool::from_fn`]
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub acquire_timeout: Duration,
    pub health_check_enabled: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(30),
            health_check_enabled: true,
        }
    }
}

/// Factory trait for creating and validating pooled handles
#[async_trait::async_trait]
pub trait ResourceFactory<T: Send + Sync + 'static>: Send + Sync {
    /// Create a new handle
    async fn create(&self) -> Result<T, ResilienceError>;

    /// Cheap no-op request against the handle
    async fn is_healthy(&self, _handle: &T) -> bool {
        true
    }

    /// Dispose of a handle that leaves the pool for good
    fn destroy(&self, handle: T) {
        drop(handle);
    }
}

/// [`ResourceFactory`] built from a plain async closure
///
/// Handles created this way are never probed (the closure knows nothing
/// about liveness); connection-level errors still get them replaced.
pub struct FnFactory<F> {
    create: F,
}

impl<F> FnFactory<F> {
    pub fn new(create: F) -> Self {
        Self { create }
    }
}

#[async_trait::async_trait]
impl<T, F, Fut> ResourceFactory<T> for FnFactory<F>
where
    T: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, ResilienceError>> + Send,
{
    async fn create(&self) -> Result<T, ResilienceError> {
        (self.create)().await
    }
}

/// A pooled handle plus its bookkeeping
struct Entry<T> {
    id: u64,
    handle: T,
    created_at: Instant,
    last_used: Instant,
    last_health_check: Option<Instant>,
}

impl<T> Entry<T> {
    fn is_expired(&self, config: &PoolConfig, now: Instant) -> bool {
        if let Some(idle_timeout) = config.idle_timeout {
            if now.saturating_duration_since(self.last_used) > idle_timeout {
                return true;
            }
        }
        if let Some(max_lifetime) = config.max_lifetime {
            if now.saturating_duration_since(self.created_at) > max_lifetime {
                return true;
            }
        }
        false
    }

    fn needs_health_check(&self, policy: HealthCheckPolicy, now: Instant) -> bool {
        match policy {
            HealthCheckPolicy::Always => true,
            HealthCheckPolicy::Never => false,
            HealthCheckPolicy::AfterIdle(after) => {
                now.saturating_duration_since(self.last_used) >= after
            }
        }
    }
}

/// Slot bookkeeping, mutated under one lock
struct Slots<T> {
    idle: VecDeque<Entry<T>>,
    /// Leased handles plus slots reserved for a handle being created
    in_use: usize,
    destroyed: u64,
    closed: bool,
}

struct PoolShared<T: Send + Sync + 'static> {
    config: PoolConfig,
    factory: Arc<dyn ResourceFactory<T>>,
    slots: Mutex<Slots<T>>,
    /// One permit per slot; tokio's semaphore queues waiters FIFO
    semaphore: Arc<Semaphore>,
    metrics: Arc<dyn MetricsSink>,
    next_id: AtomicU64,
}

impl<T: Send + Sync + 'static> PoolShared<T> {
    fn new_entry(&self, handle: T) -> Entry<T> {
        let now = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(pool = %self.config.name, resource = id, "created pooled resource");
        Entry {
            id,
            handle,
            created_at: now,
            last_used: now,
            last_health_check: None,
        }
    }

    fn report(&self, slots: &Slots<T>) {
        self.metrics
            .record_pool_size(&self.config.name, slots.idle.len(), slots.in_use);
    }

    /// Return a leased or freshly created handle to the idle set
    fn park(&self, mut entry: Entry<T>) {
        entry.last_used = Instant::now();
        let rejected = {
            let mut slots = self.slots.lock();
            slots.in_use = slots.in_use.saturating_sub(1);
            let rejected = if slots.closed {
                slots.destroyed += 1;
                Some(entry)
            } else {
                slots.idle.push_back(entry);
                None
            };
            self.report(&slots);
            rejected
        };
        if let Some(entry) = rejected {
            debug!(pool = %self.config.name, resource = entry.id, "pool closed, destroying returned resource");
            self.factory.destroy(entry.handle);
        }
    }

    /// Destroy a handle and give up its slot
    fn discard(&self, entry: Entry<T>, reason: &str) {
        {
            let mut slots = self.slots.lock();
            slots.in_use = slots.in_use.saturating_sub(1);
            slots.destroyed += 1;
            self.report(&slots);
        }
        debug!(pool = %self.config.name, resource = entry.id, reason, "destroyed pooled resource");
        self.factory.destroy(entry.handle);
    }

    /// Destroy a handle but keep its slot reserved for a replacement
    fn destroy_keep_slot(&self, entry: Entry<T>, reason: &str) {
        self.slots.lock().destroyed += 1;
        debug!(pool = %self.config.name, resource = entry.id, reason, "destroyed pooled resource");
        self.factory.destroy(entry.handle);
    }

    fn free_slot(&self) {
        let mut slots = self.slots.lock();
        slots.in_use = slots.in_use.saturating_sub(1);
        self.report(&slots);
    }

    fn closed_error(&self) -> ResilienceError {
        ResilienceError::PoolClosed {
            pool: self.config.name.clone(),
        }
    }
}

/// A slot counted in `in_use` that does not (yet) hold a handle
///
/// Dropping it frees the slot, so a cancelled creation never leaks capacity.
struct Reservation<T: Send + Sync + 'static> {
    shared: Arc<PoolShared<T>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<T: Send + Sync + 'static> Reservation<T> {
    fn into_lease(mut self, entry: Entry<T>) -> Lease<T> {
        Lease {
            entry: Some(entry),
            shared: Arc::clone(&self.shared),
            permit: self.permit.take(),
            healthy: true,
        }
    }

    fn park(mut self, entry: Entry<T>) {
        self.shared.park(entry);
        drop(self.permit.take());
    }
}

impl<T: Send + Sync + 'static> Drop for Reservation<T> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.shared.free_slot();
            drop(permit);
        }
    }
}

/// Exclusive right to one pooled handle
///
/// Hand it back with [`ResourcePool::release`]. Dropping an unreleased lease
/// returns the handle to the pool, or destroys it if
/// [`mark_unhealthy`](Lease::mark_unhealthy) was called.
pub struct Lease<T: Send + Sync + 'static> {
    entry: Option<Entry<T>>,
    shared: Arc<PoolShared<T>>,
    permit: Option<OwnedSemaphorePermit>,
    healthy: bool,
}

impl<T: Send + Sync + 'static> Lease<T> {
    /// The leased handle, `None` once released
    pub fn handle(&self) -> Option<&T> {
        self.entry.as_ref().map(|entry| &entry.handle)
    }

    pub fn handle_mut(&mut self) -> Option<&mut T> {
        self.entry.as_mut().map(|entry| &mut entry.handle)
    }

    /// Pool-unique id of the leased handle
    pub fn id(&self) -> Option<u64> {
        self.entry.as_ref().map(|entry| entry.id)
    }

    /// When the handle last passed a health check
    pub fn last_health_check(&self) -> Option<Instant> {
        self.entry.as_ref().and_then(|entry| entry.last_health_check)
    }

    pub fn pool_name(&self) -> &str {
        &self.shared.config.name
    }

    /// Discard the handle instead of reusing it when the lease is dropped
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub fn is_released(&self) -> bool {
        self.entry.is_none()
    }
}

impl<T: Send + Sync + 'static> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            if self.healthy {
                self.shared.park(entry);
            } else {
                self.shared.discard(entry, "lease dropped unhealthy");
            }
        }
        // Permit goes back only after the handle is parked, so the next
        // FIFO waiter finds it
        drop(self.permit.take());
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("pool", &self.shared.config.name)
            .field("id", &self.id())
            .field("healthy", &self.healthy)
            .finish()
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle resources ready to lease
    pub available: usize,
    /// Leased resources plus slots reserved for creation
    pub in_use: usize,
    /// Maximum pool size
    pub size: usize,
    /// Resources ever created
    pub created: u64,
    /// Resources ever destroyed
    pub destroyed: u64,
}

impl PoolStats {
    /// Get pool utilization as a percentage
    pub fn utilization(&self) -> f64 {
        if self.size == 0 {
            0.0
        } else {
            (self.in_use as f64 / self.size as f64) * 100.0
        }
    }
}

/// Builder wiring a pool to its breaker, retry policy and metrics sink
pub struct PoolBuilder<T: Send + Sync + 'static> {
    factory: Arc<dyn ResourceFactory<T>>,
    config: PoolConfig,
    breaker: Option<CircuitBreaker>,
    retry: RetryPolicy,
    metrics: Arc<dyn MetricsSink>,
}

impl<T: Send + Sync + 'static> PoolBuilder<T> {
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Breaker guarding [`ResourcePool::execute`]; defaults to one named after the pool
    pub fn breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Result<ResourcePool<T>, ResilienceError> {
        self.config.validate()?;
        self.retry.validate()?;

        let breaker = match self.breaker {
            Some(breaker) => breaker,
            None => CircuitBreaker::new(CircuitBreakerConfig {
                name: self.config.name.clone(),
                ..Default::default()
            })?
            .with_metrics(Arc::clone(&self.metrics)),
        };

        let max_size = self.config.max_size;
        self.metrics.record_pool_size(&self.config.name, 0, 0);
        info!(pool = %self.config.name, max_size, "resource pool created");

        Ok(ResourcePool {
            shared: Arc::new(PoolShared {
                config: self.config,
                factory: self.factory,
                slots: Mutex::new(Slots {
                    idle: VecDeque::with_capacity(max_size),
                    in_use: 0,
                    destroyed: 0,
                    closed: false,
                }),
                semaphore: Arc::new(Semaphore::new(max_size)),
                metrics: self.metrics,
                next_id: AtomicU64::new(0),
            }),
            breaker,
            retry: self.retry,
        })
    }
}

/// A generic resource pool
///
/// Cloning is cheap; clones share the same slots, breaker and retry policy.
///
/// # Example
/// ```no_run
/// use gatehouse_core_resilience::{CallContext, PoolOptions, ResilienceError, ResourcePool};
///
/// #[derive(Clone)]
/// struct ModelClient;
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pool = ResourcePool::from_fn(
///     || async { Ok::<_, ResilienceError>(ModelClient) },
///     4,
///     PoolOptions::default(),
/// )?;
///
/// let answer = pool
///     .execute(&CallContext::new(), |_client| async move {
///         Ok::<_, ResilienceError>("42".to_string())
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct ResourcePool<T: Send + Sync + 'static> {
    shared: Arc<PoolShared<T>>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl<T: Send + Sync + 'static> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            breaker: self.breaker.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.shared.config.name)
            .field("stats", &self.stats())
            .field("breaker", &self.breaker.state())
            .finish()
    }
}

impl<T: Send + Sync + 'static> ResourcePool<T> {
    /// Start building a pool around `factory`
    pub fn builder(factory: Arc<dyn ResourceFactory<T>>) -> PoolBuilder<T> {
        PoolBuilder {
            factory,
            config: PoolConfig::default(),
            breaker: None,
            retry: RetryPolicy::default(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Create a pool with default breaker, retry policy and no metrics
    pub fn new(
        factory: Arc<dyn ResourceFactory<T>>,
        config: PoolConfig,
    ) -> Result<Self, ResilienceError> {
        Self::builder(factory).config(config).build()
    }

    /// Create a pool of `size` handles produced by an async closure
    pub fn from_fn<F, Fut>(
        create: F,
        size: usize,
        options: PoolOptions,
    ) -> Result<Self, ResilienceError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError>> + Send + 'static,
    {
        let config = PoolConfig {
            max_size: size,
            acquire_timeout: options.acquire_timeout,
            health_check: if options.health_check_enabled {
                HealthCheckPolicy::Always
            } else {
                HealthCheckPolicy::Never
            },
            ..Default::default()
        };
        Self::new(Arc::new(FnFactory::new(create)), config)
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Acquire a resource from the pool
    ///
    /// Reuses an idle handle (health-checked per policy) or creates one when
    /// the pool is below `max_size`. When every slot is leased, waits in FIFO
    /// order until one is released, `acquire_timeout` elapses
    /// (`AcquireTimeout`) or `ctx` ends (`Cancelled` / `DeadlineExceeded`).
    pub async fn acquire(&self, ctx: &CallContext) -> Result<Lease<T>, ResilienceError> {
        let shared = &self.shared;
        let acquire_timeout = shared.config.acquire_timeout;

        let permit = match ctx
            .run(tokio::time::timeout(
                acquire_timeout,
                Arc::clone(&shared.semaphore).acquire_owned(),
            ))
            .await?
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(shared.closed_error()),
            Err(_) => {
                debug!(pool = %shared.config.name, ?acquire_timeout, "timed out waiting for a resource");
                return Err(ResilienceError::AcquireTimeout {
                    pool: shared.config.name.clone(),
                    waited: acquire_timeout,
                });
            }
        };

        let now = Instant::now();
        let (reservation, reusable, expired) = {
            let mut slots = shared.slots.lock();
            if slots.closed {
                return Err(shared.closed_error());
            }

            let mut expired = Vec::new();
            let mut kept = VecDeque::with_capacity(slots.idle.len());
            while let Some(entry) = slots.idle.pop_front() {
                if entry.is_expired(&shared.config, now) {
                    expired.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            slots.idle = kept;
            slots.destroyed += expired.len() as u64;

            // Reserve and pop in one critical section so the total never overshoots
            slots.in_use += 1;
            let reusable = slots.idle.pop_back();
            shared.report(&slots);

            let reservation = Reservation {
                shared: Arc::clone(shared),
                permit: Some(permit),
            };
            (reservation, reusable, expired)
        };

        for entry in expired {
            debug!(pool = %shared.config.name, resource = entry.id, "destroyed expired resource");
            shared.factory.destroy(entry.handle);
        }

        let Some(mut entry) = reusable else {
            let handle = match ctx.run(shared.factory.create()).await? {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(pool = %shared.config.name, error = %e, "failed to create resource");
                    return Err(e);
                }
            };
            return Ok(reservation.into_lease(shared.new_entry(handle)));
        };

        if entry.needs_health_check(shared.config.health_check, now) {
            let healthy = match ctx.run(shared.factory.is_healthy(&entry.handle)).await {
                Ok(healthy) => healthy,
                Err(e) => {
                    reservation.park(entry);
                    return Err(e);
                }
            };

            if !healthy {
                debug!(pool = %shared.config.name, resource = entry.id, "health check failed, replacing resource");
                shared.destroy_keep_slot(entry, "health check failed");
                return self.replace(ctx, reservation).await;
            }
            entry.last_health_check = Some(Instant::now());
        }

        entry.last_used = Instant::now();
        Ok(reservation.into_lease(entry))
    }

    /// Fill a reserved slot whose handle failed its health check
    async fn replace(
        &self,
        ctx: &CallContext,
        reservation: Reservation<T>,
    ) -> Result<Lease<T>, ResilienceError> {
        let shared = &self.shared;
        match ctx.run(shared.factory.create()).await? {
            Ok(handle) => Ok(reservation.into_lease(shared.new_entry(handle))),
            Err(e) => {
                warn!(
                    pool = %shared.config.name,
                    error = %e,
                    "replacement for unhealthy resource could not be created"
                );
                Err(ResilienceError::PoolExhausted {
                    pool: shared.config.name.clone(),
                })
            }
        }
    }

    /// Return a leased resource to the pool
    ///
    /// A healthy handle becomes available again. An unhealthy one is destroyed
    /// and a replacement is created before the slot is marked available; if
    /// that creation fails, or outlasts `acquire_timeout`, the slot is freed
    /// and the next acquire retries it.
    ///
    /// Releasing the same lease twice returns `LeaseAlreadyReleased` and leaves
    /// the counts untouched; a lease from another pool returns `ForeignLease`.
    pub async fn release(&self, lease: &mut Lease<T>, healthy: bool) -> Result<(), ResilienceError> {
        self.release_within(&CallContext::new(), lease, healthy).await
    }

    /// Like [`release`](Self::release), but the replacement for an unhealthy
    /// handle is also abandoned when `ctx` ends
    pub async fn release_within(
        &self,
        ctx: &CallContext,
        lease: &mut Lease<T>,
        healthy: bool,
    ) -> Result<(), ResilienceError> {
        if !Arc::ptr_eq(&lease.shared, &self.shared) {
            return Err(ResilienceError::ForeignLease);
        }
        let entry = lease
            .entry
            .take()
            .ok_or(ResilienceError::LeaseAlreadyReleased)?;
        let reservation = Reservation {
            shared: Arc::clone(&self.shared),
            permit: lease.permit.take(),
        };

        if healthy && lease.healthy {
            reservation.park(entry);
            return Ok(());
        }

        let shared = &self.shared;
        shared.destroy_keep_slot(entry, "released unhealthy");
        if shared.slots.lock().closed {
            return Ok(());
        }

        let acquire_timeout = shared.config.acquire_timeout;
        let create = tokio::time::timeout(acquire_timeout, shared.factory.create());
        match ctx.run(create).await {
            Ok(Ok(Ok(handle))) => reservation.park(shared.new_entry(handle)),
            Ok(Ok(Err(e))) => {
                warn!(
                    pool = %shared.config.name,
                    error = %e,
                    "replacement for unhealthy resource could not be created"
                );
            }
            Ok(Err(_)) => {
                warn!(
                    pool = %shared.config.name,
                    ?acquire_timeout,
                    "replacement for unhealthy resource timed out"
                );
            }
            Err(e) => {
                debug!(
                    pool = %shared.config.name,
                    error = %e,
                    "caller gave up before the replacement was created"
                );
            }
        }
        Ok(())
    }

    /// Run `op` against a pooled handle with retry and circuit breaker protection
    ///
    /// Acquire → health check → retry(breaker(op(handle))) → release. The
    /// handle is released on every exit path; it is discarded if the final
    /// error was connection-level. `op` receives a clone of the handle for
    /// each attempt.
    pub async fn execute<F, Fut, R>(&self, ctx: &CallContext, mut op: F) -> Result<R, ResilienceError>
    where
        T: Clone,
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<R, ResilienceError>>,
    {
        let mut lease = self.acquire(ctx).await?;
        let handle = lease
            .handle()
            .cloned()
            .ok_or(ResilienceError::LeaseAlreadyReleased)?;

        let outcome = self
            .retry
            .run_guarded(
                ctx,
                &self.breaker,
                &self.shared.metrics,
                self.breaker.name(),
                || op(handle.clone()),
            )
            .await;

        let healthy = match &outcome {
            Ok(_) => true,
            Err(e) => !e.is_connection_fault(),
        };
        drop(handle);
        self.release_within(ctx, &mut lease, healthy).await?;

        outcome
    }

    /// Pre-create idle resources up to `min_idle`
    ///
    /// Never exceeds `max_size` and never waits for a leased slot. Returns the
    /// number of resources created.
    pub async fn maintain_idle(&self) -> Result<usize, ResilienceError> {
        let shared = &self.shared;
        let mut created = 0;

        loop {
            let Ok(permit) = Arc::clone(&shared.semaphore).try_acquire_owned() else {
                break;
            };
            let reservation = {
                let mut slots = shared.slots.lock();
                let total = slots.idle.len() + slots.in_use;
                if slots.closed
                    || slots.idle.len() >= shared.config.min_idle
                    || total >= shared.config.max_size
                {
                    break;
                }
                slots.in_use += 1;
                Reservation {
                    shared: Arc::clone(shared),
                    permit: Some(permit),
                }
            };

            let handle = shared.factory.create().await?;
            reservation.park(shared.new_entry(handle));
            created += 1;
        }

        if created > 0 {
            debug!(pool = %shared.config.name, created, "warmed idle resources");
        }
        Ok(created)
    }

    /// Destroy all idle resources without closing the pool
    pub fn clear_idle(&self) {
        let drained: Vec<Entry<T>> = {
            let mut slots = self.shared.slots.lock();
            let drained: Vec<_> = slots.idle.drain(..).collect();
            slots.destroyed += drained.len() as u64;
            self.shared.report(&slots);
            drained
        };
        for entry in drained {
            self.shared.factory.destroy(entry.handle);
        }
    }

    /// Shut the pool down
    ///
    /// Pending and future acquires fail with `PoolClosed`; idle handles are
    /// destroyed now, leased ones when they come back.
    pub fn close(&self) {
        self.shared.semaphore.close();
        let drained: Vec<Entry<T>> = {
            let mut slots = self.shared.slots.lock();
            slots.closed = true;
            let drained: Vec<_> = slots.idle.drain(..).collect();
            slots.destroyed += drained.len() as u64;
            self.shared.report(&slots);
            drained
        };
        info!(pool = %self.shared.config.name, destroyed = drained.len(), "resource pool closed");
        for entry in drained {
            self.shared.factory.destroy(entry.handle);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.slots.lock().closed
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        let slots = self.shared.slots.lock();
        PoolStats {
            available: slots.idle.len(),
            in_use: slots.in_use,
            size: self.shared.config.max_size,
            created: self.shared.next_id.load(Ordering::Relaxed),
            destroyed: slots.destroyed,
        }
    }
}
