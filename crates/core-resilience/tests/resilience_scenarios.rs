//! End-to-end behaviour of the resilience primitives through the public API
//!
//! Time-dependent cases run on tokio's paused clock, so the asserted delays
//! are exact and the tests finish instantly.

use gatehouse_core_resilience::prelude::*;
use gatehouse_core_resilience::{InMemoryMetrics, PoolOptions, RetryOutcome};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn overloaded() -> ResilienceError {
    ResilienceError::Transient("provider returned 503".to_string())
}

#[tokio::test(start_paused = true)]
async fn breaker_fails_fast_after_threshold() {
    let breaker = CircuitBreaker::with_threshold("completions", 3, Duration::from_secs(30)).unwrap();

    for _ in 0..3 {
        let result = breaker.call(|| async { Err::<(), _>(overloaded()) }).await;
        assert!(matches!(result, Err(ResilienceError::Transient(_))));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let invoked = AtomicU32::new(0);
    let invoked = &invoked;
    let result = breaker
        .call(|| async move {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ResilienceError>(())
        })
        .await;

    assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn breaker_admits_a_single_trial_after_reset_timeout() {
    let breaker = CircuitBreaker::with_threshold("embeddings", 1, Duration::from_secs(5)).unwrap();
    let _ = breaker.call(|| async { Err::<(), _>(overloaded()) }).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(4_999)).await;
    assert!(matches!(
        breaker.call(|| async { Ok::<_, ResilienceError>(()) }).await,
        Err(ResilienceError::CircuitOpen { .. })
    ));

    tokio::time::advance(Duration::from_millis(1)).await;
    let (finish_trial, trial_gate) = tokio::sync::oneshot::channel::<()>();
    let trial_breaker = breaker.clone();
    let trial = tokio::spawn(async move {
        trial_breaker
            .call(|| async move {
                let _ = trial_gate.await;
                Ok::<_, ResilienceError>("trial")
            })
            .await
    });
    tokio::task::yield_now().await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    // Only the trial may run while HalfOpen
    let concurrent = breaker
        .call(|| async { Ok::<_, ResilienceError>("second") })
        .await;
    assert!(matches!(concurrent, Err(ResilienceError::CircuitOpen { .. })));

    finish_trial.send(()).unwrap();
    assert_eq!(trial.await.unwrap().unwrap(), "trial");
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures(), 0);

    for _ in 0..3 {
        assert!(breaker.call(|| async { Ok::<_, ResilienceError>(()) }).await.is_ok());
    }
}

#[tokio::test(start_paused = true)]
async fn closed_breaker_stays_below_threshold() {
    let threshold = 4;
    let breaker =
        CircuitBreaker::with_threshold("search", threshold, Duration::from_secs(1)).unwrap();

    for round in 0..20u32 {
        let fail = round % 7 != 6;
        let _ = breaker
            .call(|| async move {
                if fail {
                    Err(overloaded())
                } else {
                    Ok(())
                }
            })
            .await;

        match breaker.state() {
            CircuitState::Closed => assert!(breaker.consecutive_failures() < threshold),
            CircuitState::Open => tokio::time::advance(Duration::from_secs(1)).await,
            CircuitState::HalfOpen => panic!("no trial should be left in flight"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn rate_limiter_burst_then_refill() {
    let limiter = RateLimiter::new(10.0, 5.0).unwrap();

    for _ in 0..10 {
        assert!(limiter.allow("tenant-a", 1.0));
    }
    assert!(!limiter.allow("tenant-a", 1.0));

    tokio::time::advance(Duration::from_secs(1)).await;
    let granted = (0..10).filter(|_| limiter.allow("tenant-a", 1.0)).count();
    assert_eq!(granted, 5);
}

#[tokio::test(start_paused = true)]
async fn rate_limiter_tokens_stay_in_bounds() {
    let limiter = RateLimiter::new(8.0, 3.0).unwrap();
    let costs = [1.0, 2.5, 0.5, 4.0, 8.0, 1.0, 3.0];

    for (i, cost) in costs.iter().cycle().take(60).enumerate() {
        let key = if i % 3 == 0 { "tenant-a" } else { "tenant-b" };
        limiter.allow(key, *cost);

        for key in ["tenant-a", "tenant-b"] {
            let tokens = limiter.tokens(key);
            assert!((0.0..=8.0).contains(&tokens), "{} has {} tokens", key, tokens);
        }
        tokio::time::advance(Duration::from_millis(250 * (i as u64 % 5))).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn rate_limiter_never_double_spends_across_threads() {
    // Refill is negligible for the test's lifetime, so only the burst is spendable
    let capacity = 100;
    let limiter = RateLimiter::new(capacity as f64, 1e-9).unwrap();
    let start = Arc::new(tokio::sync::Barrier::new(64));

    let mut tasks = Vec::new();
    for _ in 0..64 {
        let limiter = limiter.clone();
        let start = Arc::clone(&start);
        tasks.push(tokio::spawn(async move {
            start.wait().await;
            let mut admitted = 0usize;
            for _ in 0..10 {
                if limiter.allow("shared-tenant", 1.0) {
                    admitted += 1;
                }
                tokio::task::yield_now().await;
            }
            admitted
        }));
    }

    let mut admitted = 0;
    for task in tasks {
        admitted += task.await.unwrap();
    }
    assert_eq!(admitted, capacity);
    assert!(limiter.tokens("shared-tenant") < 1.0);
}

#[tokio::test(start_paused = true)]
async fn pool_serves_blocked_waiters_in_fifo_order() {
    let pool = ResourcePool::from_fn(
        {
            let next = Arc::new(AtomicU64::new(0));
            move || {
                let next = Arc::clone(&next);
                async move { Ok::<_, ResilienceError>(next.fetch_add(1, Ordering::SeqCst)) }
            }
        },
        2,
        PoolOptions {
            acquire_timeout: Duration::from_secs(60),
            health_check_enabled: false,
        },
    )
    .unwrap();
    let ctx = CallContext::new();

    let mut first = pool.acquire(&ctx).await.unwrap();
    let mut second = pool.acquire(&ctx).await.unwrap();

    let served = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for label in ["third", "fourth"] {
        let pool = pool.clone();
        let served = Arc::clone(&served);
        waiters.push(tokio::spawn(async move {
            let mut lease = pool.acquire(&CallContext::new()).await.unwrap();
            served.lock().push(label);
            pool.release(&mut lease, true).await.unwrap();
        }));
        tokio::task::yield_now().await;
    }

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(served.lock().is_empty(), "waiters must block while the pool is full");

    pool.release(&mut first, true).await.unwrap();
    tokio::task::yield_now().await;
    pool.release(&mut second, true).await.unwrap();

    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(*served.lock(), vec!["third", "fourth"]);

    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.available, 2);
    assert_eq!(stats.created, 2);
}

#[tokio::test(start_paused = true)]
async fn pool_acquire_times_out_then_recovers() {
    let pool = ResourcePool::from_fn(
        || async { Ok::<_, ResilienceError>(()) },
        1,
        PoolOptions {
            acquire_timeout: Duration::from_millis(200),
            health_check_enabled: true,
        },
    )
    .unwrap();
    let ctx = CallContext::new();

    let mut held = pool.acquire(&ctx).await.unwrap();
    let start = Instant::now();
    let result = pool.acquire(&ctx).await;
    assert!(matches!(
        result,
        Err(ResilienceError::AcquireTimeout { waited, .. }) if waited == Duration::from_millis(200)
    ));
    assert!(start.elapsed() >= Duration::from_millis(200));

    pool.release(&mut held, true).await.unwrap();
    assert!(pool.acquire(&ctx).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn pool_acquire_honours_caller_deadline() {
    let pool = ResourcePool::from_fn(
        || async { Ok::<_, ResilienceError>(()) },
        1,
        PoolOptions::default(),
    )
    .unwrap();
    let _held = pool.acquire(&CallContext::new()).await.unwrap();

    let ctx = CallContext::with_timeout(Duration::from_millis(50));
    let result = pool.acquire(&ctx).await;
    assert!(matches!(result, Err(ResilienceError::DeadlineExceeded)));
    assert_eq!(pool.stats().in_use, 1);
}

#[tokio::test]
async fn releasing_twice_is_rejected() {
    let pool = ResourcePool::from_fn(
        || async { Ok::<_, ResilienceError>("client") },
        2,
        PoolOptions::default(),
    )
    .unwrap();
    let ctx = CallContext::new();

    let mut lease = pool.acquire(&ctx).await.unwrap();
    let _other = pool.acquire(&ctx).await.unwrap();
    pool.release(&mut lease, true).await.unwrap();
    let before = pool.stats();

    assert!(matches!(
        pool.release(&mut lease, true).await,
        Err(ResilienceError::LeaseAlreadyReleased)
    ));
    assert!(matches!(
        pool.release(&mut lease, false).await,
        Err(ResilienceError::LeaseAlreadyReleased)
    ));
    assert_eq!(pool.stats(), before);
    assert_eq!(before.available + before.in_use, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_never_double_leases_under_contention() {
    let size = 3;
    let pool = ResourcePool::from_fn(
        {
            let next = Arc::new(AtomicU64::new(0));
            move || {
                let next = Arc::clone(&next);
                async move { Ok::<_, ResilienceError>(next.fetch_add(1, Ordering::SeqCst)) }
            }
        },
        size,
        PoolOptions {
            acquire_timeout: Duration::from_secs(10),
            health_check_enabled: false,
        },
    )
    .unwrap();
    let leased = Arc::new(Mutex::new(HashSet::new()));

    let mut tasks = Vec::new();
    for i in 0..48u32 {
        let pool = pool.clone();
        let leased = Arc::clone(&leased);
        tasks.push(tokio::spawn(async move {
            let mut lease = pool.acquire(&CallContext::new()).await.unwrap();
            let id = *lease.handle().unwrap();
            assert!(leased.lock().insert(id), "handle {} leased twice", id);

            let stats = pool.stats();
            assert!(stats.available + stats.in_use <= stats.size);

            tokio::time::sleep(Duration::from_millis(1 + u64::from(i % 3))).await;
            assert!(leased.lock().remove(&id));
            pool.release(&mut lease, i % 5 != 0).await.unwrap();
        }));
    }
    for task in futures::future::join_all(tasks).await {
        task.unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert!(stats.available <= size);
    assert_eq!(stats.created - stats.destroyed, stats.available as u64);
}

#[tokio::test(start_paused = true)]
async fn retry_backs_off_exponentially_until_success() {
    let policy = RetryPolicy::exponential(3, Duration::from_millis(500));
    let attempts = AtomicU32::new(0);
    let attempts = &attempts;

    let start = Instant::now();
    let result = policy
        .run(&CallContext::new(), "completions", || async move {
            match attempts.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(overloaded()),
                _ => Ok("done"),
            }
        })
        .await;

    assert_eq!(result.unwrap(), "done");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(start.elapsed() >= Duration::from_millis(1_500));
}

#[tokio::test(start_paused = true)]
async fn pooled_execute_stops_retrying_once_breaker_opens() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let sink: Arc<dyn MetricsSink> = metrics.clone();
    let breaker = CircuitBreaker::with_threshold("vector-store", 2, Duration::from_secs(30))
        .unwrap()
        .with_metrics(Arc::clone(&sink));
    let factory: Arc<dyn ResourceFactory<u8>> =
        Arc::new(gatehouse_core_resilience::FnFactory::new(|| async {
            Ok::<u8, ResilienceError>(0)
        }));
    let pool = ResourcePool::builder(factory)
        .config(PoolConfig {
            name: "vector-store".to_string(),
            max_size: 1,
            ..Default::default()
        })
        .breaker(breaker)
        .retry(RetryPolicy::exponential(5, Duration::from_millis(100)))
        .metrics(sink)
        .build()
        .unwrap();

    let attempts = AtomicU32::new(0);
    let attempts = &attempts;
    let result = pool
        .execute(&CallContext::new(), |_client| async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(overloaded())
        })
        .await;

    match result {
        Err(ResilienceError::RetryExhausted {
            attempts: reported,
            breaker_state,
            ..
        }) => {
            assert_eq!(reported, 2);
            assert_eq!(breaker_state, CircuitState::Open);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.breaker_open("vector-store"), 1);
    assert_eq!(metrics.retry_count("vector-store", RetryOutcome::Exhausted), 1);
    assert_eq!(metrics.pool_size("vector-store"), Some((1, 0)));
}
