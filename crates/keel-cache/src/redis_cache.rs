//! Network-shared cache backed by Redis.
//!
//! The connection is opened lazily on the first command and reused for the
//! life of the backend. Every transport failure surfaces as
//! [`KeelError::BackendUnavailable`].

use std::time::Duration;

use async_trait::async_trait;
use keel_config::RedisSettings;
use keel_core::{KeelError, KeelResult};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::backend::{CacheBackend, Counter};

// INCR, then start the window only when the counter is new (or has lost its
// expiry), then report the remaining window.
const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 or redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return {count, redis.call('PTTL', KEYS[1])}
";

/// A Redis-backed cache shared by every worker process.
pub struct RedisCache {
    client: redis::Client,
    url: String,
    connect_timeout: Duration,
    connection: OnceCell<ConnectionManager>,
    increment: Script,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("url", &self.url)
            .field("connect_timeout", &self.connect_timeout)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisCache {
    /// Creates a backend for the configured server. No I/O happens here.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the connection URL is malformed.
    pub fn new(settings: &RedisSettings) -> KeelResult<Self> {
        let url = settings.url();
        let client = redis::Client::open(url.as_str())
            .map_err(|e| KeelError::backend_unavailable_with_source("invalid redis url", e))?;

        Ok(Self {
            client,
            url,
            connect_timeout: settings.connect_timeout(),
            connection: OnceCell::new(),
            increment: Script::new(INCREMENT_SCRIPT),
        })
    }

    async fn connection(&self) -> KeelResult<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                debug!(url = %self.url, "connecting to redis");
                match tokio::time::timeout(
                    self.connect_timeout,
                    ConnectionManager::new(self.client.clone()),
                )
                .await
                {
                    Ok(Ok(manager)) => Ok(manager),
                    Ok(Err(e)) => {
                        warn!(url = %self.url, error = %e, "redis connection failed");
                        Err(KeelError::backend_unavailable_with_source(
                            "failed to connect to redis",
                            e,
                        ))
                    }
                    Err(_) => {
                        warn!(url = %self.url, "redis connection timed out");
                        Err(KeelError::backend_unavailable(format!(
                            "timed out connecting to redis after {:?}",
                            self.connect_timeout
                        )))
                    }
                }
            })
            .await?;
        Ok(manager.clone())
    }
}

fn unavailable(e: redis::RedisError) -> KeelError {
    KeelError::backend_unavailable_with_source("redis command failed", e)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CacheBackend for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> KeelResult<Option<String>> {
        let mut conn = self.connection().await?;
        conn.get(key).await.map_err(unavailable)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KeelResult<()> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> KeelResult<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.del(key).await.map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str, window: Duration) -> KeelResult<Counter> {
        let mut conn = self.connection().await?;
        let (count, ttl_ms): (i64, i64) = self
            .increment
            .key(key)
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(Counter {
            count: u64::try_from(count).unwrap_or(0),
            ttl: u64::try_from(ttl_ms).map_or(window, Duration::from_millis),
        })
    }

    async fn clear(&self) -> KeelResult<()> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        debug!(url = %self.url, "redis database flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_settings() -> RedisSettings {
        RedisSettings {
            enabled: true,
            host: "127.0.0.1".to_string(),
            // Port 1 is reserved and never has a redis server behind it.
            port: 1,
            connect_timeout_secs: 1,
            ..RedisSettings::default()
        }
    }

    #[test]
    fn test_construction_does_no_io() {
        let cache = RedisCache::new(&unreachable_settings()).unwrap();
        assert!(!cache.connection.initialized());
        assert!(format!("{cache:?}").contains("redis://127.0.0.1:1/1"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_backend_unavailable() {
        let cache = RedisCache::new(&unreachable_settings()).unwrap();
        let err = cache
            .increment("rate_limit|test", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::BackendUnavailable { .. }));
    }

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }
}
