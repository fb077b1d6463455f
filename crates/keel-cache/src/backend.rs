//! The cache backend abstraction.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::KeelResult;

/// A shared, type-erased cache backend.
pub type SharedCache = Arc<dyn CacheBackend>;

/// State of a counter after an atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// Value after the increment.
    pub count: u64,
    /// Time until the counter expires.
    pub ttl: Duration,
}

/// A string key/value store with expiry.
///
/// Implementations must make [`CacheBackend::increment`] atomic with respect
/// to concurrent callers on the same key: two callers never observe the same
/// post-increment count.
#[async_trait]
pub trait CacheBackend: Send + Sync + fmt::Debug {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Reads a value. Expired entries read as `None`.
    async fn get(&self, key: &str) -> KeelResult<Option<String>>;

    /// Writes a value, replacing any previous one. `ttl = None` never expires.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KeelResult<()>;

    /// Removes a value. Returns whether it existed.
    async fn delete(&self, key: &str) -> KeelResult<bool>;

    /// Atomically increments the counter at `key`.
    ///
    /// A missing or expired counter starts at 1 and expires after `window`.
    /// Later increments leave the expiry untouched, so a window is never
    /// extended by activity inside it.
    async fn increment(&self, key: &str, window: Duration) -> KeelResult<Counter>;

    /// Removes every entry.
    async fn clear(&self) -> KeelResult<()>;
}
