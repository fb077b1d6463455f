//! Process-local cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use keel_core::{KeelError, KeelResult};
use tokio::time::Instant;
use tracing::trace;

use crate::backend::{CacheBackend, Counter};

/// Writes between sweeps of expired entries.
const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// An in-memory cache that lives as long as the process.
///
/// Expiry is evaluated lazily on access and against `tokio::time::Instant`,
/// so paused-clock tests can advance it. Keys that are written once and never
/// read again are reclaimed by a sweep that runs every 1024 writes.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    writes: AtomicU64,
}

impl MemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every expired entry.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }

    /// Counts a write and sweeps on every `SWEEP_EVERY`th one.
    ///
    /// Must not be called while holding an entry guard.
    fn note_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY == 0 {
            let before = self.entries.len();
            self.purge_expired();
            let removed = before.saturating_sub(self.entries.len());
            trace!(removed, "swept expired cache entries");
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> KeelResult<Option<String>> {
        let now = Instant::now();
        match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KeelResult<()> {
        self.note_write();
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> KeelResult<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn increment(&self, key: &str, window: Duration) -> KeelResult<Counter> {
        self.note_write();
        let now = Instant::now();
        let fresh = || Entry {
            value: "1".to_string(),
            expires_at: Some(now + window),
        };

        // The entry guard holds the shard lock for the whole read-modify-write.
        let entry = match self.entries.entry(key.to_string()) {
            MapEntry::Vacant(vacant) => vacant.insert(fresh()),
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh());
                } else {
                    let count: u64 = occupied.get().value.parse().map_err(|_| {
                        KeelError::internal(format!("cache value at {key} is not a counter"))
                    })?;
                    let current = occupied.get_mut();
                    current.value = (count + 1).to_string();
                    if current.expires_at.is_none() {
                        current.expires_at = Some(now + window);
                    }
                }
                occupied.into_ref()
            }
        };

        let count = entry.value.parse().unwrap_or(1);
        let ttl = entry
            .expires_at
            .map_or(window, |at| at.saturating_duration_since(now));
        Ok(Counter { count, ttl })
    }

    async fn clear(&self) -> KeelResult<()> {
        self.entries.clear();
        Ok(())
    }
}
