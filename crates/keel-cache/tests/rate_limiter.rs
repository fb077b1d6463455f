//! Rate limiter behaviour under concurrency and backend failure.

use std::sync::Arc;
use std::time::Duration;

use keel_cache::{MemoryCache, RateLimiter, RedisCache, SharedCache};
use keel_config::RedisSettings;
use keel_core::KeelError;
use tokio::task::JoinSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checks_never_over_admit() {
    let shared: SharedCache = Arc::new(MemoryCache::new());
    let limit = 10;

    let mut tasks = JoinSet::new();
    for _ in 0..64 {
        // Separate limiter instances over one backend, as separate workers would be.
        let limiter = RateLimiter::new(Arc::clone(&shared));
        tasks.spawn(async move {
            limiter
                .check_and_consume("203.0.113.9", "submit", limit, Duration::from_secs(60))
                .await
                .unwrap()
        });
    }

    let mut admitted = 0;
    let mut remaining_seen = Vec::new();
    while let Some(result) = tasks.join_next().await {
        let decision = result.unwrap();
        if decision.allowed {
            admitted += 1;
            remaining_seen.push(decision.remaining);
        }
    }

    assert_eq!(admitted, limit);
    remaining_seen.sort_unstable();
    assert_eq!(remaining_seen, (0..limit).collect::<Vec<_>>());
}

#[tokio::test]
async fn unreachable_backend_is_reported_not_allowed() {
    let settings = RedisSettings {
        enabled: true,
        host: "127.0.0.1".to_string(),
        port: 1,
        connect_timeout_secs: 1,
        ..RedisSettings::default()
    };
    let limiter = RateLimiter::new(Arc::new(RedisCache::new(&settings).unwrap()));

    let result = limiter
        .check_and_consume("client", "login", 5, Duration::from_secs(60))
        .await;
    assert!(matches!(result, Err(KeelError::BackendUnavailable { .. })));
}
