//! Namespaced views over a shared backend.

use std::time::Duration;

use async_trait::async_trait;
use keel_core::{KeelError, KeelResult};

use crate::backend::{CacheBackend, Counter, SharedCache};

/// A view of a backend that prepends a fixed prefix to every key.
///
/// ```
/// use std::sync::Arc;
/// use keel_cache::{CacheBackend, MemoryCache, PrefixedCache};
///
/// # tokio_test::block_on(async {
/// let shared = Arc::new(MemoryCache::new());
/// let sessions = PrefixedCache::new(shared.clone(), "session|");
///
/// sessions.set("abc", "{}", None).await.unwrap();
/// assert!(shared.get("session|abc").await.unwrap().is_some());
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct PrefixedCache {
    inner: SharedCache,
    prefix: String,
}

impl PrefixedCache {
    /// Wraps `inner`, namespacing keys under `prefix`.
    pub fn new(inner: SharedCache, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    /// The key prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

#[async_trait]
impl CacheBackend for PrefixedCache {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> KeelResult<Option<String>> {
        self.inner.get(&self.key(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KeelResult<()> {
        self.inner.set(&self.key(key), value, ttl).await
    }

    async fn delete(&self, key: &str) -> KeelResult<bool> {
        self.inner.delete(&self.key(key)).await
    }

    async fn increment(&self, key: &str, window: Duration) -> KeelResult<Counter> {
        self.inner.increment(&self.key(key), window).await
    }

    /// A view cannot clear only its own namespace, so this always fails
    /// rather than flushing the whole backend.
    async fn clear(&self) -> KeelResult<()> {
        Err(KeelError::internal(format!(
            "cannot clear the {} view of a shared cache",
            self.prefix
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryCache;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_views_do_not_collide() {
        let shared: SharedCache = Arc::new(MemoryCache::new());
        let a = PrefixedCache::new(Arc::clone(&shared), "a|");
        let b = PrefixedCache::new(Arc::clone(&shared), "b|");

        a.set("k", "from-a", None).await.unwrap();
        b.set("k", "from-b", None).await.unwrap();

        assert_eq!(a.get("k").await.unwrap().as_deref(), Some("from-a"));
        assert_eq!(b.get("k").await.unwrap().as_deref(), Some("from-b"));
        assert_eq!(shared.get("a|k").await.unwrap().as_deref(), Some("from-a"));
    }

    #[tokio::test]
    async fn test_clear_is_refused() {
        let shared: SharedCache = Arc::new(MemoryCache::new());
        shared.set("other", "1", None).await.unwrap();

        let view = PrefixedCache::new(Arc::clone(&shared), "session|");
        assert!(view.clear().await.is_err());
        assert!(shared.get("other").await.unwrap().is_some());
    }
}
