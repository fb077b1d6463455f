//! Error types for keel.
//!
//! This module provides the [`KeelError`] type, the single error taxonomy used
//! by the registry, the cache layer, the event bus and the request pipeline.
//!
//! # Categories
//!
//! Every error maps to an [`ErrorCategory`], which in turn maps to the HTTP
//! status used when the error reaches the error-handling frame:
//!
//! | `ErrorCategory`    | Status |
//! |--------------------|--------|
//! | `Configuration`    | 500    |
//! | `Validation`       | 400 (413 for an oversized body) |
//! | `Forbidden`        | 403    |
//! | `NotFound`         | 404    |
//! | `MethodNotAllowed` | 405    |
//! | `RateLimited`      | 429    |
//! | `Unavailable`      | 503    |
//! | `Internal`         | 500    |

use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using [`KeelError`].
pub type KeelResult<T> = Result<T, KeelError>;

/// Categories of errors for classification and handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Wiring defects: unknown services, cycles, failing factories.
    Configuration,
    /// Malformed client input.
    Validation,
    /// Request-level protection failures (CSRF).
    Forbidden,
    /// No route for the requested path.
    NotFound,
    /// A route exists for the path but not for the method.
    MethodNotAllowed,
    /// Rate limit exceeded.
    RateLimited,
    /// A backing store could not be reached.
    Unavailable,
    /// Anything else.
    Internal,
}

impl ErrorCategory {
    /// Returns the default HTTP status code for this error category.
    #[must_use]
    pub const fn default_status_code(&self) -> StatusCode {
        match self {
            Self::Configuration | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Standard error type for keel.
///
/// # Example
///
/// ```
/// use keel_core::{ErrorCategory, KeelError};
///
/// let err = KeelError::unknown_service("mailer");
/// assert_eq!(err.category(), ErrorCategory::Configuration);
/// assert!(err.to_string().contains("mailer"));
/// ```
#[derive(Error, Debug)]
pub enum KeelError {
    /// No descriptor is registered under the requested key.
    #[error("unknown service: {key}")]
    UnknownService {
        /// The key that was requested.
        key: String,
    },

    /// Resolution re-entered a key that was still being resolved.
    #[error("circular dependency detected: {}", chain.join(" -> "))]
    CircularDependency {
        /// The resolution stack, ending with the repeated key.
        chain: Vec<String>,
    },

    /// The resolved instance is not of the requested type.
    #[error("service {key} is not of type {expected}")]
    ServiceTypeMismatch {
        /// The key that was requested.
        key: String,
        /// The type the caller asked for.
        expected: &'static str,
    },

    /// A service factory returned an error.
    #[error("factory for service {key} failed: {source}")]
    ServiceFactory {
        /// The key being constructed.
        key: String,
        /// The underlying failure.
        source: anyhow::Error,
    },

    /// The cache or session store could not be reached.
    #[error("backend unavailable: {message}")]
    BackendUnavailable {
        /// Human-readable error message.
        message: String,
        /// The underlying transport error.
        #[source]
        source: Option<anyhow::Error>,
    },

    /// The caller exceeded a rate limit.
    #[error("You have exceeded the rate limit for this application.")]
    RateLimitExceeded {
        /// Seconds until the current window resets.
        retry_after_secs: Option<u64>,
    },

    /// A protected mutation carried a missing or wrong CSRF token.
    #[error("CSRF validation error: {message}")]
    CsrfValidation {
        /// Human-readable error message.
        message: String,
    },

    /// No route matches the request path.
    #[error("no route found for {method} {path}")]
    RouteNotFound {
        /// Request method.
        method: String,
        /// Request path.
        path: String,
    },

    /// The path matched but the method did not.
    #[error("method {method} is not allowed for {path}")]
    MethodNotAllowed {
        /// Request method.
        method: String,
        /// Request path.
        path: String,
        /// Methods the path does accept.
        allowed: Vec<String>,
    },

    /// The request could not be understood (e.g. a malformed body).
    #[error("bad request: {message}")]
    BadRequest {
        /// Human-readable error message.
        message: String,
    },

    /// The request body exceeded the configured size limit.
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge {
        /// The limit in bytes.
        limit: usize,
    },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
        /// The underlying error (not exposed to clients in production).
        #[source]
        source: Option<anyhow::Error>,
    },
}

impl KeelError {
    /// Creates an unknown service error.
    #[must_use]
    pub fn unknown_service(key: impl Into<String>) -> Self {
        Self::UnknownService { key: key.into() }
    }

    /// Creates a circular dependency error from a resolution stack.
    #[must_use]
    pub fn circular(chain: Vec<String>) -> Self {
        Self::CircularDependency { chain }
    }

    /// Wraps the failure of the factory for `key`.
    pub fn service_factory(key: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::ServiceFactory {
            key: key.into(),
            source: source.into(),
        }
    }

    /// Creates a backend unavailable error.
    #[must_use]
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a backend unavailable error with a source error.
    pub fn backend_unavailable_with_source(
        message: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Creates a rate limit exceeded error.
    #[must_use]
    pub fn rate_limited(retry_after_secs: Option<u64>) -> Self {
        Self::RateLimitExceeded { retry_after_secs }
    }

    /// Creates a CSRF validation error.
    #[must_use]
    pub fn csrf(message: impl Into<String>) -> Self {
        Self::CsrfValidation {
            message: message.into(),
        }
    }

    /// Creates a bad request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Creates a payload too large error.
    #[must_use]
    pub fn payload_too_large(limit: usize) -> Self {
        Self::PayloadTooLarge { limit }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an internal error with a source error.
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownService { .. }
            | Self::CircularDependency { .. }
            | Self::ServiceTypeMismatch { .. }
            | Self::ServiceFactory { .. } => ErrorCategory::Configuration,
            Self::BackendUnavailable { .. } => ErrorCategory::Unavailable,
            Self::RateLimitExceeded { .. } => ErrorCategory::RateLimited,
            Self::CsrfValidation { .. } => ErrorCategory::Forbidden,
            Self::RouteNotFound { .. } => ErrorCategory::NotFound,
            Self::MethodNotAllowed { .. } => ErrorCategory::MethodNotAllowed,
            Self::BadRequest { .. } | Self::PayloadTooLarge { .. } => ErrorCategory::Validation,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => self.category().default_status_code(),
        }
    }

    /// Whether this error is an expected, client-caused outcome.
    ///
    /// Expected errors are logged at `info`; everything else at `error`.
    #[must_use]
    pub const fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. }
                | Self::CsrfValidation { .. }
                | Self::RouteNotFound { .. }
                | Self::MethodNotAllowed { .. }
                | Self::BadRequest { .. }
                | Self::PayloadTooLarge { .. }
        )
    }

    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownService { .. } => "UNKNOWN_SERVICE",
            Self::CircularDependency { .. } => "CIRCULAR_DEPENDENCY",
            Self::ServiceTypeMismatch { .. } => "SERVICE_TYPE_MISMATCH",
            Self::ServiceFactory { .. } => "SERVICE_FACTORY_FAILED",
            Self::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            Self::RateLimitExceeded { .. } => "RATE_LIMITED",
            Self::CsrfValidation { .. } => "CSRF_VALIDATION_FAILED",
            Self::RouteNotFound { .. } => "NOT_FOUND",
            Self::MethodNotAllowed { .. } => "METHOD_NOT_ALLOWED",
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Renders the full `source()` chain, outermost first.
    #[must_use]
    pub fn origin_chain(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        let mut current = std::error::Error::source(self);
        while let Some(err) = current {
            chain.push(err.to_string());
            current = err.source();
        }
        chain
    }

    /// Converts this error to a serializable error envelope.
    ///
    /// With `verbose` set, the envelope carries the origin chain and
    /// category-specific details; otherwise server-side failures are reduced
    /// to a generic message.
    #[must_use]
    pub fn to_envelope(&self, request_id: Option<&str>, verbose: bool) -> ErrorEnvelope {
        let status = self.status_code();
        let message = if status.is_server_error() && !verbose {
            GENERIC_MESSAGE.to_string()
        } else {
            self.to_string()
        };

        let details = if verbose {
            let mut details = self.error_details().unwrap_or_else(|| serde_json::json!({}));
            details["origin"] = serde_json::json!(self.origin_chain());
            Some(details)
        } else if status.is_client_error() {
            self.error_details()
        } else {
            None
        };

        ErrorEnvelope {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message,
                category: self.category(),
                details,
            },
            request_id: request_id.map(ToString::to_string),
        }
    }

    fn error_details(&self) -> Option<serde_json::Value> {
        match self {
            Self::RateLimitExceeded {
                retry_after_secs: Some(seconds),
            } => Some(serde_json::json!({ "retry_after_seconds": seconds })),
            Self::MethodNotAllowed { allowed, .. } => {
                Some(serde_json::json!({ "allowed": allowed }))
            }
            Self::PayloadTooLarge { limit } => Some(serde_json::json!({ "max_bytes": limit })),
            _ => None,
        }
    }
}

/// Message used for server-side failures in production.
pub const GENERIC_MESSAGE: &str = "An internal error occurred";

/// Serializable error envelope for HTTP responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// The error details.
    pub error: ErrorDetail,
    /// The request ID for correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Error detail within an envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Error category.
    pub category: ErrorCategory,
    /// Additional error details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
