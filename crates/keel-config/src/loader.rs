//! Configuration loader with layered approach.
//!
//! This module provides the [`ConfigLoader`] for loading settings from
//! multiple sources: defaults, files, and environment variables.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use keel_core::Environment;

use crate::{ConfigError, Settings};

/// Configuration loader with layered approach.
///
/// Layers are applied in order, later layers overriding earlier ones:
/// 1. Default values (built into the code)
/// 2. Configuration file (TOML or JSON)
/// 3. Environment variables
///
/// # Example
///
/// ```no_run
/// use keel_config::ConfigLoader;
///
/// # fn main() -> Result<(), keel_config::ConfigError> {
/// let settings = ConfigLoader::new()
///     .with_optional_file("config/settings.toml")?
///     .with_env_prefix("KEEL")
///     .load()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConfigLoader {
    settings: Settings,
    env_prefix: Option<String>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a new loader starting from default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            env_prefix: None,
        }
    }

    /// Load settings from a file. The format follows the extension.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file is missing, unreadable, malformed,
    /// or contains unknown fields.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::file_not_found(path));
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::read_error(path, e))?;

        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        self.settings = parse(&content, &format)?;

        Ok(self)
    }

    /// Load settings from a file if it exists.
    pub fn with_optional_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            self.with_file(path)
        } else {
            Ok(self)
        }
    }

    /// Load settings from a string in the given format (`toml` or `json`).
    ///
    /// # Example
    ///
    /// ```
    /// use keel_config::ConfigLoader;
    ///
    /// let toml = r#"
    ///     environment = "production"
    ///
    ///     [rate_limit]
    ///     enabled = true
    ///     limit = 5
    /// "#;
    ///
    /// let settings = ConfigLoader::new()
    ///     .with_string(toml, "toml")
    ///     .unwrap()
    ///     .load()
    ///     .unwrap();
    ///
    /// assert!(settings.is_production());
    /// assert_eq!(settings.rate_limit.limit, 5);
    /// assert_eq!(settings.rate_limit.window_secs, 60);
    /// ```
    pub fn with_string(mut self, content: &str, format: &str) -> Result<Self, ConfigError> {
        self.settings = parse(content, &format.to_lowercase())?;
        Ok(self)
    }

    /// Set environment variable prefix for overrides.
    ///
    /// Variables use the format `PREFIX__SECTION__KEY`, for example
    /// `KEEL__REDIS__ENABLED=true` or `KEEL__ENVIRONMENT=production`.
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_uppercase());
        self
    }

    /// Load a `.env` file into the process environment, if present.
    #[must_use]
    pub fn with_dotenv(self) -> Self {
        // A missing .env file is not an error.
        let _ = dotenvy::dotenv();
        self
    }

    /// Apply environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if an override cannot be parsed or the final
    /// settings fail validation.
    pub fn load(mut self) -> Result<Settings, ConfigError> {
        if let Some(prefix) = self.env_prefix.take() {
            let vars: HashMap<String, String> = env::vars()
                .filter(|(k, _)| k.starts_with(&prefix))
                .collect();
            for (key, value) in vars {
                self.apply_env_var(&key, &value, &prefix)?;
            }
        }

        self.settings.validate()?;
        Ok(self.settings)
    }

    fn apply_env_var(&mut self, key: &str, value: &str, prefix: &str) -> Result<(), ConfigError> {
        let Some(rest) = key.strip_prefix(prefix).and_then(|k| k.strip_prefix("__")) else {
            // Shares the prefix but is not one of ours (e.g. KEEL_HOME).
            return Ok(());
        };

        let parts: Vec<&str> = rest.split("__").collect();
        let s = &mut self.settings;

        match parts.as_slice() {
            ["APP_NAME"] => s.app_name = value.to_string(),
            ["ENVIRONMENT"] => s.environment = parse_environment(key, value)?,
            ["BASE_DIR"] => s.base_dir = value.into(),
            ["TEMP_DIR"] => s.temp_dir = value.into(),
            ["CONFIG_DIR"] => s.config_dir = value.into(),

            ["SERVER", "HTTP_ADDR"] => s.server.http_addr = value.to_string(),
            ["SERVER", "MAX_BODY_BYTES"] => s.server.max_body_bytes = parse_num(key, value)?,

            ["REDIS", "ENABLED"] => s.redis.enabled = parse_bool(key, value)?,
            ["REDIS", "HOST"] => s.redis.host = value.to_string(),
            ["REDIS", "PORT"] => s.redis.port = parse_num(key, value)?,
            ["REDIS", "DATABASE"] => s.redis.database = parse_num(key, value)?,
            ["REDIS", "CONNECT_TIMEOUT_SECS"] => {
                s.redis.connect_timeout_secs = parse_num(key, value)?;
            }

            ["SESSION", "COOKIE_NAME"] => s.session.cookie_name = value.to_string(),
            ["SESSION", "COOKIE_PATH"] => s.session.cookie_path = value.to_string(),
            ["SESSION", "TTL_SECS"] => s.session.ttl_secs = parse_num(key, value)?,
            ["SESSION", "KEY_PREFIX"] => s.session.key_prefix = value.to_string(),
            ["SESSION", "SECURE_COOKIE"] => s.session.secure_cookie = parse_bool(key, value)?,

            ["RATE_LIMIT", "ENABLED"] => s.rate_limit.enabled = parse_bool(key, value)?,
            ["RATE_LIMIT", "LIMIT"] => s.rate_limit.limit = parse_num(key, value)?,
            ["RATE_LIMIT", "WINDOW_SECS"] => s.rate_limit.window_secs = parse_num(key, value)?,
            ["RATE_LIMIT", "FAIL_OPEN"] => s.rate_limit.fail_open = parse_bool(key, value)?,

            ["HTTP", "TRUSTED_PROXIES"] => {
                s.http.trusted_proxies = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect();
            }
            ["HTTP", "CLIENT_TIMEOUT_SECS"] => {
                s.http.client_timeout_secs = parse_num(key, value)?;
            }

            ["LOGGING", "LEVEL"] => s.logging.level = Some(value.to_string()),
            ["LOGGING", "JSON"] => s.logging.json = Some(parse_bool(key, value)?),

            _ => return Err(ConfigError::env_parse_error(key, "unknown configuration key")),
        }

        Ok(())
    }
}

fn parse(content: &str, format: &str) -> Result<Settings, ConfigError> {
    match format {
        "toml" => Ok(toml::from_str(content)?),
        "json" => Ok(serde_json::from_str(content)?),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::env_parse_error(key, "expected boolean")),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::env_parse_error(key, "expected integer"))
}

fn parse_environment(key: &str, value: &str) -> Result<Environment, ConfigError> {
    match value.to_lowercase().as_str() {
        "production" | "prod" => Ok(Environment::Production),
        "development" | "dev" => Ok(Environment::Development),
        "testing" | "test" => Ok(Environment::Testing),
        _ => Err(ConfigError::env_parse_error(
            key,
            "expected production, development or testing",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_defaults() {
        let settings = ConfigLoader::new().load().unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_with_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
app_name = "radio"

[redis]
enabled = true
host = "redis"
"#
        )
        .unwrap();

        let settings = ConfigLoader::new().with_file(file.path()).unwrap().load().unwrap();
        assert_eq!(settings.app_name, "radio");
        assert!(settings.enable_redis());
        assert_eq!(settings.redis.url(), "redis://redis:6379/1");
    }

    #[test]
    fn test_with_json_string() {
        let json = r#"{"session": {"cookie_name": "sid"}}"#;
        let settings = ConfigLoader::new()
            .with_string(json, "json")
            .unwrap()
            .load()
            .unwrap();
        assert_eq!(settings.session.cookie_name, "sid");
        assert_eq!(settings.session.ttl_secs, 43_200);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = ConfigLoader::new().with_string("[redis]\nhostname = \"x\"", "toml");
        assert!(matches!(result, Err(ConfigError::TomlError(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigLoader::new().with_file("/nonexistent/keel.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_optional_missing_file_is_ok() {
        assert!(ConfigLoader::new()
            .with_optional_file("/nonexistent/keel.toml")
            .is_ok());
    }

    #[test]
    fn test_unsupported_format() {
        let result = ConfigLoader::new().with_string("x: 1", "yaml");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_env_overrides() {
        env::set_var("KEELTESTENV__ENVIRONMENT", "production");
        env::set_var("KEELTESTENV__RATE_LIMIT__LIMIT", "5");
        env::set_var("KEELTESTENV__SERVER__MAX_BODY_BYTES", "4096");
        env::set_var("KEELTESTENV__HTTP__TRUSTED_PROXIES", "10.0.0.1, 10.0.0.2");

        let settings = ConfigLoader::new()
            .with_env_prefix("KEELTESTENV")
            .load()
            .unwrap();

        assert!(settings.is_production());
        assert_eq!(settings.rate_limit.limit, 5);
        assert_eq!(settings.server.max_body_bytes, 4096);
        assert_eq!(settings.http.trusted_proxies, vec!["10.0.0.1", "10.0.0.2"]);

        env::remove_var("KEELTESTENV__ENVIRONMENT");
        env::remove_var("KEELTESTENV__RATE_LIMIT__LIMIT");
        env::remove_var("KEELTESTENV__SERVER__MAX_BODY_BYTES");
        env::remove_var("KEELTESTENV__HTTP__TRUSTED_PROXIES");
    }

    #[test]
    fn test_env_bad_value() {
        env::set_var("KEELBADENV__REDIS__PORT", "not-a-port");
        let result = ConfigLoader::new().with_env_prefix("KEELBADENV").load();
        env::remove_var("KEELBADENV__REDIS__PORT");

        assert!(matches!(result, Err(ConfigError::EnvParseError { .. })));
    }
}
