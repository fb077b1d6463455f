//! Fixed-window rate limiting.
//!
//! Each `(client, action)` pair owns one bucket: a counter in the cache whose
//! expiry marks the end of its window. The first request of a window creates
//! the counter and starts the window; every later request in the window
//! increments it, denied ones included, so hammering a limit never extends or
//! resets the window. When the counter expires the next request starts a new
//! window at 1.
//!
//! Atomicity comes from [`CacheBackend::increment`], so concurrent requests
//! for the same bucket are never both admitted past the limit.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_core::{KeelError, KeelResult};
use tracing::debug;

use crate::backend::SharedCache;
use crate::prefixed::PrefixedCache;

/// Key prefix for rate-limit buckets.
pub const BUCKET_PREFIX: &str = "rate_limit|";

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u64,
    /// The configured limit.
    pub limit: u64,
    /// Time until the window resets.
    pub reset_after: Duration,
    /// Wall-clock time at which the window resets.
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Whole seconds until reset, rounded up.
    #[must_use]
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        if self.reset_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }

    /// Converts a denial into the caller-facing error.
    pub fn into_result(self) -> KeelResult<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(KeelError::rate_limited(Some(self.retry_after_secs())))
        }
    }
}

/// Decides allow/deny per caller against a cache backend.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    cache: SharedCache,
}

impl RateLimiter {
    /// Creates a limiter storing buckets in `cache` under [`BUCKET_PREFIX`].
    pub fn new(cache: SharedCache) -> Self {
        Self {
            cache: Arc::new(PrefixedCache::new(cache, BUCKET_PREFIX)),
        }
    }

    /// Name of the backend holding the buckets.
    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.cache.name()
    }

    /// Counts one request against the `(client_key, action_key)` bucket.
    ///
    /// # Errors
    ///
    /// - `Internal` if `limit` or `window` is zero
    /// - `BackendUnavailable` if the cache cannot be reached; the limiter
    ///   never reports an unreachable backend as "allowed"
    pub async fn check_and_consume(
        &self,
        client_key: &str,
        action_key: &str,
        limit: u64,
        window: Duration,
    ) -> KeelResult<RateLimitDecision> {
        if limit == 0 || window.is_zero() {
            return Err(KeelError::internal(
                "rate limit and window must both be positive",
            ));
        }

        let key = bucket_key(client_key, action_key);
        let counter = self.cache.increment(&key, window).await?;

        let allowed = counter.count <= limit;
        let decision = RateLimitDecision {
            allowed,
            remaining: limit.saturating_sub(counter.count),
            limit,
            reset_after: counter.ttl,
            reset_at: Utc::now()
                + chrono::Duration::from_std(counter.ttl).unwrap_or(chrono::Duration::zero()),
        };

        debug!(
            rate_limit.key = %key,
            count = counter.count,
            limit,
            allowed,
            backend = self.cache.name(),
            "rate limit checked"
        );
        Ok(decision)
    }
}

/// Key of a bucket within the limiter's namespace.
#[must_use]
pub fn bucket_key(client_key: &str, action_key: &str) -> String {
    format!("{client_key}|{action_key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryCache;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryCache::new()))
    }

    #[test]
    fn test_bucket_key() {
        assert_eq!(bucket_key("10.0.0.1", "login"), "10.0.0.1|login");
    }

    #[tokio::test]
    async fn test_buckets_live_under_prefix() {
        let shared: SharedCache = Arc::new(MemoryCache::new());
        let limiter = RateLimiter::new(Arc::clone(&shared));
        limiter
            .check_and_consume("10.0.0.1", "login", 5, Duration::from_secs(60))
            .await
            .unwrap();

        let raw = shared.get("rate_limit|10.0.0.1|login").await.unwrap();
        assert_eq!(raw.as_deref(), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_five_sequence() {
        let limiter = limiter();
        let window = Duration::from_secs(60);

        let mut remaining = Vec::new();
        for _ in 0..5 {
            let decision = limiter
                .check_and_consume("client", "login", 5, window)
                .await
                .unwrap();
            assert!(decision.allowed);
            remaining.push(decision.remaining);
        }
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let denied = limiter
            .check_and_consume("client", "login", 5, window)
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        let fresh = limiter
            .check_and_consume("client", "login", 5, window)
            .await
            .unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_attempts_do_not_extend_window() {
        let limiter = limiter();
        let window = Duration::from_secs(10);

        limiter.check_and_consume("c", "a", 1, window).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let denied = limiter.check_and_consume("c", "a", 1, window).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reset_after, Duration::from_secs(4));
        assert_eq!(denied.retry_after_secs(), 4);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(limiter.check_and_consume("c", "a", 1, window).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_buckets_are_per_client_and_action() {
        let limiter = limiter();
        let window = Duration::from_secs(60);

        assert!(limiter.check_and_consume("a", "x", 1, window).await.unwrap().allowed);
        assert!(limiter.check_and_consume("b", "x", 1, window).await.unwrap().allowed);
        assert!(limiter.check_and_consume("a", "y", 1, window).await.unwrap().allowed);
        assert!(!limiter.check_and_consume("a", "x", 1, window).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_zero_limit_rejected() {
        let limiter = limiter();
        assert!(limiter
            .check_and_consume("a", "x", 0, Duration::from_secs(1))
            .await
            .is_err());
        assert!(limiter
            .check_and_consume("a", "x", 1, Duration::ZERO)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_into_result() {
        let limiter = limiter();
        let window = Duration::from_secs(30);
        limiter.check_and_consume("a", "x", 1, window).await.unwrap();

        let err = limiter
            .check_and_consume("a", "x", 1, window)
            .await
            .unwrap()
            .into_result()
            .unwrap_err();
        assert!(matches!(
            err,
            KeelError::RateLimitExceeded { retry_after_secs: Some(s) } if s <= 30
        ));
    }
}
