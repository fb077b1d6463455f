//! Ambient process context.
//!
//! [`ExecutionContext`] tells service factories which kind of process they are
//! being built for. It is handed to the registry at construction and never read
//! from global state, so every environment-conditioned factory can be tested
//! by simply building a registry with the other variant.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of process the registry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    /// A long-lived worker serving HTTP requests.
    WebWorker,
    /// A one-shot command-line invocation.
    Cli,
}

impl ExecutionContext {
    /// Returns `true` for command-line invocations.
    #[must_use]
    pub const fn is_cli(self) -> bool {
        matches!(self, Self::Cli)
    }

    /// Returns the context name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WebWorker => "web",
            Self::Cli => "cli",
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Production: generic error responses, `info` logging.
    Production,
    /// Local development: verbose errors, `debug` logging.
    #[default]
    Development,
    /// Automated tests.
    Testing,
}

impl Environment {
    /// Returns `true` in production.
    #[must_use]
    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Production => "production",
            Self::Development => "development",
            Self::Testing => "testing",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_context() {
        assert!(ExecutionContext::Cli.is_cli());
        assert!(!ExecutionContext::WebWorker.is_cli());
        assert_eq!(ExecutionContext::WebWorker.to_string(), "web");
    }

    #[test]
    fn test_environment_serde() {
        let env: Environment = serde_json::from_str("\"production\"").unwrap();
        assert!(env.is_production());
        assert_eq!(Environment::default(), Environment::Development);
    }
}
