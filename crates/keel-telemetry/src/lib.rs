//! Logging and metrics for keel.
//!
//! - **Logging**: `tracing` subscriber setup, JSON in production and pretty
//!   output elsewhere
//! - **Metrics**: request, rate-limit and error counters via the `metrics`
//!   facade
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_telemetry::{init_telemetry, LogConfig};
//!
//! init_telemetry(&LogConfig::from_settings(&settings))?;
//! ```

#![doc(html_root_url = "https://docs.rs/keel-telemetry/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod error;
pub mod logging;
pub mod metrics;

pub use error::TelemetryError;
pub use logging::{init_logging, LogConfig};

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Installs the log subscriber and registers metric descriptions.
///
/// # Errors
///
/// Returns an error if logging initialization fails.
pub fn init_telemetry(config: &LogConfig) -> TelemetryResult<()> {
    if config.service_name.is_empty() {
        return Err(TelemetryError::InvalidConfig(
            "service name must not be empty".to_string(),
        ));
    }
    init_logging(config)?;
    crate::metrics::describe_metrics();
    Ok(())
}
