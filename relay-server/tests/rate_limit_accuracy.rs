//! Several gateways sharing one backend must enforce a single window.

use std::sync::Arc;
use std::time::Duration;

use relay_core::config::{BreakerConfig, RateLimitConfig};
use relay_core::store::MemoryBackend;
use relay_core::StateBackend;
use relay_server::subsystems::circuit_breaker::BreakerRegistry;
use relay_server::subsystems::rate_limiter::{LimitSubject, RateLimiter};

fn limiters(count: usize, requests_per_window: u64) -> Vec<Arc<RateLimiter>> {
    let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
    (0..count)
        .map(|_| {
            Arc::new(RateLimiter::new(
                backend.clone(),
                Arc::new(BreakerRegistry::new(BreakerConfig::default())),
                RateLimitConfig {
                    window_seconds: 60,
                    requests_per_window,
                    ..RateLimitConfig::default()
                },
                "relay",
                Duration::from_secs(1),
            ))
        })
        .collect()
}

// ============================================================================
// TEST 1: 5 gateways x 50 rps x 10 s against 100 per minute
// ============================================================================
#[tokio::test]
async fn test_five_gateways_share_one_window() {
    let limiters = limiters(5, 100);
    let subject = LimitSubject::tenant("acme", "pro");
    let key = limiters[0].key_for(&subject);
    let spec = limiters[0].resolve(&subject);
    let start_ms = 1_700_000_000_000_i64;

    let mut allowed = 0;
    // 20 ms between requests per gateway, gateways offset by 4 ms.
    for tick in 0..500_i64 {
        for (g, limiter) in limiters.iter().enumerate() {
            let now_ms = start_ms + tick * 20 + g as i64 * 4;
            let result = limiter.check_at(&subject, &key, &spec, 1, 1, now_ms).await;
            assert!(!result.degraded);
            if result.allowed {
                allowed += 1;
            }
        }
    }
    assert!(allowed <= 105, "allowed {} requests", allowed);
    assert_eq!(allowed, 100);
}

// ============================================================================
// TEST 2: concurrent callers never overshoot
// ============================================================================
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checks_are_atomic() {
    let limiters = limiters(5, 100);
    let mut handles = Vec::new();
    for limiter in limiters {
        handles.push(tokio::spawn(async move {
            let subject = LimitSubject::tenant("acme", "pro");
            let mut allowed = 0;
            for _ in 0..50 {
                if limiter.check_and_consume(&subject, 1, 1).await.allowed {
                    allowed += 1;
                }
            }
            allowed
        }));
    }
    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    assert_eq!(total, 100);
}

// ============================================================================
// TEST 3: capacity returns as entries slide out of the window
// ============================================================================
#[tokio::test]
async fn test_window_slides() {
    let limiters = limiters(2, 3);
    let subject = LimitSubject::tenant("acme", "pro");
    let key = limiters[0].key_for(&subject);
    let spec = limiters[0].resolve(&subject);
    let t0 = 1_700_000_000_000_i64;

    for (i, limiter) in [&limiters[0], &limiters[1], &limiters[0]].iter().enumerate() {
        let result = limiter.check_at(&subject, &key, &spec, 1, 1, t0 + i as i64 * 1_000).await;
        assert!(result.allowed);
    }
    let denied = limiters[1].check_at(&subject, &key, &spec, 1, 1, t0 + 30_000).await;
    assert!(!denied.allowed);
    assert_eq!(denied.requests_remaining, 0);
    // The oldest entry (t0) leaves the window at t0 + 60 s.
    assert_eq!(denied.retry_after, Some(Duration::from_millis(30_000)));

    let still_denied = limiters[0].check_at(&subject, &key, &spec, 1, 1, t0 + 59_999).await;
    assert!(!still_denied.allowed);
    let allowed = limiters[0].check_at(&subject, &key, &spec, 1, 1, t0 + 60_001).await;
    assert!(allowed.allowed);
}

// ============================================================================
// TEST 4: weighted units are limited independently of request count
// ============================================================================
#[tokio::test]
async fn test_weighted_units_limit() {
    let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
    let limiter = RateLimiter::new(
        backend,
        Arc::new(BreakerRegistry::new(BreakerConfig::default())),
        RateLimitConfig {
            requests_per_window: 100,
            units_per_window: 1_000,
            ..RateLimitConfig::default()
        },
        "relay",
        Duration::from_secs(1),
    );
    let subject = LimitSubject::tenant("acme", "pro");
    assert!(limiter.check_and_consume(&subject, 1, 600).await.allowed);
    let second = limiter.check_and_consume(&subject, 1, 600).await;
    assert!(!second.allowed);
    assert_eq!(second.units_remaining, 400);
    assert!(limiter.check_and_consume(&subject, 1, 400).await.allowed);
}
