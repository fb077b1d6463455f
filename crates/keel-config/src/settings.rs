//! Settings types.
//!
//! [`Settings`] is the root of the configuration tree. Every section has
//! defaults, so an empty file (or no file at all) yields a working
//! development configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use keel_core::Environment;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Complete application settings.
///
/// # Example
///
/// ```
/// use keel_config::Settings;
///
/// let settings = Settings::default();
/// assert_eq!(settings.server.http_addr, "0.0.0.0:8080");
/// assert_eq!(settings.session.cookie_name, "app_session");
/// assert!(!settings.is_production());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Application name, used as the log service name.
    pub app_name: String,
    /// Deployment environment.
    pub environment: Environment,
    /// Application root directory.
    pub base_dir: PathBuf,
    /// Scratch directory for caches and logs.
    pub temp_dir: PathBuf,
    /// Directory holding application configuration.
    pub config_dir: PathBuf,
    /// HTTP listener settings.
    pub server: ServerSettings,
    /// Shared cache settings.
    pub redis: RedisSettings,
    /// Session persistence settings.
    pub session: SessionSettings,
    /// Default rate-limit policy.
    pub rate_limit: RateLimitSettings,
    /// Proxy trust and outbound client settings.
    pub http: HttpSettings,
    /// Logging overrides.
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "keel".to_string(),
            environment: Environment::default(),
            base_dir: PathBuf::from("."),
            temp_dir: PathBuf::from("./tmp"),
            config_dir: PathBuf::from("./config"),
            server: ServerSettings::default(),
            redis: RedisSettings::default(),
            session: SessionSettings::default(),
            rate_limit: RateLimitSettings::default(),
            http: HttpSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Settings {
    /// Returns `true` when running in production.
    #[must_use]
    pub fn is_production(&self) -> bool {
        self.environment.is_production()
    }

    /// Whether the shared Redis cache is configured.
    #[must_use]
    pub fn enable_redis(&self) -> bool {
        self.redis.enabled
    }

    /// Validate the settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if:
    /// - the server address is not a socket address
    /// - the body limit is zero
    /// - the rate limit or its window is zero
    /// - a trusted proxy is not an IP address
    /// - the session TTL is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.http_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::invalid_value(
                "server.http_addr",
                format!("invalid socket address: {}", self.server.http_addr),
            ));
        }

        if self.server.max_body_bytes == 0 {
            return Err(ConfigError::invalid_value(
                "server.max_body_bytes",
                "must be a positive size",
            ));
        }

        if self.rate_limit.limit == 0 {
            return Err(ConfigError::invalid_value(
                "rate_limit.limit",
                "must be a positive integer",
            ));
        }

        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::invalid_value(
                "rate_limit.window_secs",
                "must be a positive duration",
            ));
        }

        if self.session.ttl_secs == 0 {
            return Err(ConfigError::invalid_value(
                "session.ttl_secs",
                "must be a positive duration",
            ));
        }

        if let Some(bad) = self
            .http
            .trusted_proxies
            .iter()
            .find(|p| p.parse::<IpAddr>().is_err())
        {
            return Err(ConfigError::invalid_value(
                "http.trusted_proxies",
                format!("not an IP address: {bad}"),
            ));
        }

        Ok(())
    }

    /// Production preset: JSON logs at `info`, generic error pages.
    #[must_use]
    pub fn production() -> Self {
        Self {
            environment: Environment::Production,
            ..Self::default()
        }
    }
}

/// Default request body limit (1 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    /// Address to bind.
    pub http_addr: String,
    /// Largest request body accepted, in bytes.
    pub max_body_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Shared cache (Redis) settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RedisSettings {
    /// Whether the shared cache is used at all.
    pub enabled: bool,
    /// Redis host.
    pub host: String,
    /// Redis port.
    pub port: u16,
    /// Logical database index.
    pub database: i64,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 6379,
            database: 1,
            connect_timeout_secs: 15,
        }
    }
}

impl RedisSettings {
    /// Connection URL for the configured server and database.
    #[must_use]
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.database)
    }

    /// Connection timeout as a `Duration`.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Session persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSettings {
    /// Cookie carrying the session identifier.
    pub cookie_name: String,
    /// Cookie path.
    pub cookie_path: String,
    /// Session lifetime in seconds.
    pub ttl_secs: u64,
    /// Cache key prefix for stored sessions.
    pub key_prefix: String,
    /// Whether to mark the cookie `Secure`.
    pub secure_cookie: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            cookie_name: "app_session".to_string(),
            cookie_path: "/".to_string(),
            ttl_secs: 43_200,
            key_prefix: "session|".to_string(),
            secure_cookie: false,
        }
    }
}

impl SessionSettings {
    /// Session lifetime as a `Duration`.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Default rate-limit policy applied by the rate-limit frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSettings {
    /// Whether the frame enforces a global per-client policy.
    pub enabled: bool,
    /// Requests allowed per window.
    pub limit: u64,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Allow requests when the backend is unreachable.
    pub fail_open: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 100,
            window_secs: 60,
            fail_open: true,
        }
    }
}

impl RateLimitSettings {
    /// Window length as a `Duration`.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Proxy trust and outbound client settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HttpSettings {
    /// Peer addresses whose forwarded headers are honoured.
    pub trusted_proxies: Vec<String>,
    /// Timeout for outbound HTTP calls, in seconds.
    pub client_timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            trusted_proxies: Vec::new(),
            client_timeout_secs: 3,
        }
    }
}

impl HttpSettings {
    /// Trusted proxies parsed as IP addresses; invalid entries are skipped.
    #[must_use]
    pub fn trusted_proxy_addrs(&self) -> Vec<IpAddr> {
        self.trusted_proxies
            .iter()
            .filter_map(|p| p.parse().ok())
            .collect()
    }

    /// Outbound client timeout as a `Duration`.
    #[must_use]
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

/// Logging overrides. Unset fields follow the environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    /// Filter directive, e.g. `"info"` or `"keel=debug,hyper=warn"`.
    pub level: Option<String>,
    /// Force JSON (`true`) or pretty (`false`) output.
    pub json: Option<bool>,
}
