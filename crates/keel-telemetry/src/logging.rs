//! Structured logging for keel.
//!
//! Production processes emit JSON lines at `info`; everything else gets
//! human-readable output at `debug`. Both can be overridden through the
//! `[logging]` settings section.
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_telemetry::logging::{init_logging, LogConfig};
//!
//! let config = LogConfig::from_settings(&settings);
//! init_logging(&config)?;
//!
//! tracing::info!(request_id = %id, "request completed");
//! ```

use keel_config::Settings;
use keel_core::Environment;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::TelemetryError;
use crate::TelemetryResult;

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Whether logging is enabled.
    pub enabled: bool,

    /// Filter directive (e.g., "info", "keel=debug,hyper=warn").
    pub level: String,

    /// Whether to output JSON format.
    pub json_format: bool,

    /// Whether to include span close events.
    pub span_events: bool,

    /// Whether to include file/line info.
    pub file_line_info: bool,

    /// Whether to include target (module path).
    pub include_target: bool,

    /// Service name recorded on the root span.
    pub service_name: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::for_environment(Environment::default())
    }
}

impl LogConfig {
    /// Creates a development configuration with human-readable output.
    #[must_use]
    pub fn development() -> Self {
        Self {
            enabled: true,
            level: "debug".to_string(),
            json_format: false,
            span_events: true,
            file_line_info: true,
            include_target: true,
            service_name: "keel".to_string(),
        }
    }

    /// Creates a production configuration with JSON output.
    #[must_use]
    pub fn production() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            json_format: true,
            span_events: false,
            file_line_info: false,
            include_target: true,
            service_name: "keel".to_string(),
        }
    }

    /// Picks the preset matching `environment`.
    #[must_use]
    pub fn for_environment(environment: Environment) -> Self {
        if environment.is_production() {
            Self::production()
        } else {
            Self::development()
        }
    }

    /// Builds the configuration from application settings, applying any
    /// `[logging]` overrides on top of the environment preset.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        let mut config = Self::for_environment(settings.environment);
        config.service_name.clone_from(&settings.app_name);
        if let Some(level) = &settings.logging.level {
            config.level.clone_from(level);
        }
        if let Some(json) = settings.logging.json {
            config.json_format = json;
        }
        config
    }
}

/// Initializes the global subscriber.
///
/// # Errors
///
/// Returns `TelemetryError::LoggingInit` if the filter is invalid or a global
/// subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let filter = create_env_filter(&config.level)?;

    let span_events = if config.span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    if config.json_format {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.file_line_info)
            .with_line_number(config.file_line_info)
            .with_target(config.include_target)
            .with_filter(filter);

        tracing_subscriber::registry()
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.file_line_info)
            .with_line_number(config.file_line_info)
            .with_target(config.include_target)
            .with_filter(filter);

        tracing_subscriber::registry()
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
    }

    tracing::debug!(service = %config.service_name, json = config.json_format, "logging initialized");
    Ok(())
}

/// Creates an env filter from a string.
///
/// # Errors
///
/// Returns an error if the filter string is invalid.
pub fn create_env_filter(filter: &str) -> TelemetryResult<EnvFilter> {
    EnvFilter::try_new(filter)
        .map_err(|e| TelemetryError::LoggingInit(format!("Invalid log level: {e}")))
}

/// Standard log field names.
///
/// Use these field names for consistency across logs.
pub mod fields {
    /// Request ID field name.
    pub const REQUEST_ID: &str = "request_id";

    /// HTTP method field name.
    pub const HTTP_METHOD: &str = "http.method";

    /// HTTP path field name.
    pub const HTTP_PATH: &str = "http.path";

    /// HTTP status code field name.
    pub const HTTP_STATUS: &str = "http.status_code";

    /// Duration field name (in milliseconds).
    pub const DURATION_MS: &str = "duration_ms";

    /// Error field name.
    pub const ERROR: &str = "error";

    /// Service registry key field name.
    pub const SERVICE: &str = "service";

    /// Lifecycle phase field name.
    pub const PHASE: &str = "phase";

    /// Rate-limit action field name.
    pub const ACTION: &str = "action";
}
