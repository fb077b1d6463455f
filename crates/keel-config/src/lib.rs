//! # Keel Config
//!
//! Typed, layered configuration for keel applications.
//!
//! Settings are loaded from built-in defaults, then an optional TOML or JSON
//! file, then `PREFIX__SECTION__KEY` environment variables (optionally seeded
//! from a `.env` file).
//!
//! ```
//! use keel_config::ConfigLoader;
//!
//! let settings = ConfigLoader::new().load().unwrap();
//! assert_eq!(settings.rate_limit.window_secs, 60);
//! ```

#![doc(html_root_url = "https://docs.rs/keel-config/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod error;
mod loader;
mod settings;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use settings::{
    HttpSettings, LoggingSettings, RateLimitSettings, RedisSettings, ServerSettings,
    SessionSettings, Settings, DEFAULT_MAX_BODY_BYTES,
};
