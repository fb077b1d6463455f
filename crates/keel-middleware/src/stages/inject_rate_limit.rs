//! Rate-limiter injection.
//!
//! Every request gets a [`RateLimitHandle`] bound to its client key, so
//! handlers can check their own per-action limits (`login`, `signup`, ...).
//! With a [`RateLimitPolicy`] the frame also counts every request against a
//! global `request` bucket and short-circuits with 429 once it is spent.
//!
//! # Response headers
//!
//! With a policy, every response carries:
//!
//! - `x-ratelimit-limit`: the window's limit
//! - `x-ratelimit-remaining`: requests left in the window
//! - `x-ratelimit-reset`: Unix timestamp at which the window resets
//! - `x-ratelimit-reset-after`: seconds until the window resets
//!
//! Denials also carry `retry-after`.

use std::time::Duration;

use http::header::{HeaderValue, RETRY_AFTER};
use keel_cache::{RateLimitDecision, RateLimiter};
use keel_config::RateLimitSettings;
use keel_core::{KeelError, KeelResult};
use tracing::{info, warn};

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::types::{MiddlewareResult, Request, Response, ResponseExt};

/// Rate limit header names.
pub mod headers {
    /// Maximum requests allowed in the window.
    pub const LIMIT: &str = "x-ratelimit-limit";
    /// Remaining requests in the current window.
    pub const REMAINING: &str = "x-ratelimit-remaining";
    /// Unix timestamp when the window resets.
    pub const RESET: &str = "x-ratelimit-reset";
    /// Seconds until the window resets.
    pub const RESET_AFTER: &str = "x-ratelimit-reset-after";
}

/// Action key of the global policy bucket.
pub const GLOBAL_ACTION: &str = "request";

/// A rate limiter bound to one client.
#[derive(Debug, Clone)]
pub struct RateLimitHandle {
    limiter: RateLimiter,
    client_key: String,
}

impl RateLimitHandle {
    /// Binds `limiter` to `client_key`.
    #[must_use]
    pub fn new(limiter: RateLimiter, client_key: impl Into<String>) -> Self {
        Self {
            limiter,
            client_key: client_key.into(),
        }
    }

    /// The client key buckets are counted under.
    #[must_use]
    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    /// Counts one attempt at `action` and reports the decision.
    pub async fn check(
        &self,
        action: &str,
        limit: u64,
        window: Duration,
    ) -> KeelResult<RateLimitDecision> {
        self.limiter
            .check_and_consume(&self.client_key, action, limit, window)
            .await
    }

    /// Like [`check`](Self::check), but a denial is returned as
    /// `RateLimitExceeded`.
    pub async fn enforce(
        &self,
        action: &str,
        limit: u64,
        window: Duration,
    ) -> KeelResult<RateLimitDecision> {
        let decision = self.check(action, limit, window).await?;
        if !decision.allowed {
            keel_telemetry::metrics::record_rate_limit_denied(action);
        }
        decision.into_result()
    }
}

/// A limit applied to every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Requests allowed per window.
    pub limit: u64,
    /// Window length.
    pub window: Duration,
    /// Let requests through when the backend is unreachable.
    pub fail_open: bool,
}

impl RateLimitPolicy {
    /// The policy configured by `settings`, if enabled.
    #[must_use]
    pub fn from_settings(settings: &RateLimitSettings) -> Option<Self> {
        settings.enabled.then(|| Self {
            limit: settings.limit,
            window: settings.window(),
            fail_open: settings.fail_open,
        })
    }
}

/// Attaches a [`RateLimitHandle`] and applies the optional global policy.
#[derive(Debug, Clone)]
pub struct InjectRateLimitMiddleware {
    limiter: RateLimiter,
    policy: Option<RateLimitPolicy>,
}

impl InjectRateLimitMiddleware {
    /// Injects `limiter` without a global policy.
    #[must_use]
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            limiter,
            policy: None,
        }
    }

    /// Applies `policy` to every request.
    #[must_use]
    pub fn with_policy(mut self, policy: Option<RateLimitPolicy>) -> Self {
        self.policy = policy;
        self
    }
}

fn add_rate_limit_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    headers.insert(headers::LIMIT, HeaderValue::from(decision.limit));
    headers.insert(headers::REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(headers::RESET, HeaderValue::from(decision.reset_at.timestamp()));
    headers.insert(
        headers::RESET_AFTER,
        HeaderValue::from(decision.retry_after_secs()),
    );
}

impl Middleware for InjectRateLimitMiddleware {
    fn name(&self) -> &'static str {
        "inject_rate_limit"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            let handle = RateLimitHandle::new(self.limiter.clone(), ctx.client_key());

            let Some(policy) = self.policy else {
                ctx.set_extension(handle);
                return next.run(ctx, request).await;
            };

            let decision = match handle.check(GLOBAL_ACTION, policy.limit, policy.window).await {
                Ok(decision) => Some(decision),
                Err(err) if policy.fail_open => {
                    warn!(request_id = %ctx.request_id(), error = %err, "rate limiter unavailable, allowing request");
                    None
                }
                Err(err) => return Err(err),
            };
            ctx.set_extension(handle);

            let Some(decision) = decision else {
                return next.run(ctx, request).await;
            };

            if !decision.allowed {
                keel_telemetry::metrics::record_rate_limit_denied(GLOBAL_ACTION);
                info!(
                    request_id = %ctx.request_id(),
                    rate_limit.key = %ctx.client_key(),
                    "rate limit exceeded"
                );
                let err = KeelError::rate_limited(Some(decision.retry_after_secs()));
                let request_id = ctx.request_id().to_string();
                let mut response = Response::from_error(&err, &err.to_envelope(Some(&request_id), false));
                add_rate_limit_headers(&mut response, &decision);
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(decision.retry_after_secs()));
                return Ok(response);
            }

            let mut response = next.run(ctx, request).await?;
            add_rate_limit_headers(&mut response, &decision);
            Ok(response)
        })
    }
}
