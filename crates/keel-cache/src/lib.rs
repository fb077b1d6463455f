//! # Keel Cache
//!
//! Cache backends and the rate limiter built on them.
//!
//! - [`CacheBackend`] - async get/set/delete/increment-with-expiry interface
//! - [`MemoryCache`] - process-local, non-persisted
//! - [`RedisCache`] - network-shared across worker processes
//! - [`PrefixedCache`] - a namespaced view of another backend
//! - [`RateLimiter`] - fixed-window allow/deny decisions
//!
//! [`select_backend`] picks the backend for a process: the shared cache only
//! for web workers with Redis enabled, the process-local cache otherwise.
//! Command-line tooling flushes the shared cache (`cache:clear`), so it keeps
//! its own rate-limit bookkeeping off that backend.

#![doc(html_root_url = "https://docs.rs/keel-cache/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod backend;
mod memory;
mod prefixed;
pub mod rate_limit;
mod redis_cache;

use std::sync::Arc;

use keel_config::RedisSettings;
use keel_core::{ExecutionContext, KeelResult};
use tracing::info;

pub use backend::{CacheBackend, Counter, SharedCache};
pub use memory::MemoryCache;
pub use prefixed::PrefixedCache;
pub use rate_limit::{RateLimitDecision, RateLimiter};
pub use redis_cache::RedisCache;

/// Builds the cache backend appropriate for `context`.
///
/// # Errors
///
/// Returns `BackendUnavailable` if Redis is selected and its URL is invalid.
/// No connection is attempted here.
pub fn select_backend(
    context: ExecutionContext,
    settings: &RedisSettings,
) -> KeelResult<SharedCache> {
    let cache: SharedCache = if settings.enabled && !context.is_cli() {
        Arc::new(RedisCache::new(settings)?)
    } else {
        Arc::new(MemoryCache::new())
    };
    info!(backend = cache.name(), context = %context, "cache backend selected");
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_enabled() -> RedisSettings {
        RedisSettings {
            enabled: true,
            ..RedisSettings::default()
        }
    }

    #[test]
    fn test_web_worker_with_redis_uses_shared_cache() {
        let cache = select_backend(ExecutionContext::WebWorker, &redis_enabled()).unwrap();
        assert_eq!(cache.name(), "redis");
    }

    #[test]
    fn test_cli_never_uses_shared_cache() {
        let cache = select_backend(ExecutionContext::Cli, &redis_enabled()).unwrap();
        assert_eq!(cache.name(), "memory");
    }

    #[test]
    fn test_redis_disabled_uses_memory() {
        let cache =
            select_backend(ExecutionContext::WebWorker, &RedisSettings::default()).unwrap();
        assert_eq!(cache.name(), "memory");
    }
}
