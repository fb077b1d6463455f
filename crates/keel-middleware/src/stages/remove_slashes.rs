//! Trailing-slash normalization.
//!
//! `/users/` is redirected to `/users` before routing runs, so routes are
//! only ever matched against canonical paths. The root path `/` is left
//! alone. `GET` and `HEAD` get a 301; other methods get a 308 so clients
//! repeat the method and body.
//!
//! Leading runs of slashes (or backslashes) collapse to one `/`, so the
//! `Location` is always a path on this host and never a scheme-relative URL
//! such as `//other.example`.

use http::{Method, StatusCode};
use tracing::debug;

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::types::{MiddlewareResult, Request, Response, ResponseExt};

/// Redirects paths with trailing slashes to their canonical form.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveTrailingSlashMiddleware;

impl RemoveTrailingSlashMiddleware {
    /// Creates the frame.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// The canonical form of `path`, or `None` if it has no trailing slash.
#[must_use]
pub fn canonical_path(path: &str) -> Option<String> {
    if path.len() <= 1 || !path.ends_with('/') {
        return None;
    }
    let rest = path.trim_start_matches(['/', '\\']).trim_end_matches('/');
    Some(format!("/{rest}"))
}

impl Middleware for RemoveTrailingSlashMiddleware {
    fn name(&self) -> &'static str {
        "remove_trailing_slash"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            let Some(canonical) = canonical_path(request.uri().path()) else {
                return next.run(ctx, request).await;
            };

            let location = match request.uri().query() {
                Some(query) => format!("{canonical}?{query}"),
                None => canonical,
            };
            let status = if matches!(*request.method(), Method::GET | Method::HEAD) {
                StatusCode::MOVED_PERMANENTLY
            } else {
                StatusCode::PERMANENT_REDIRECT
            };

            debug!(
                request_id = %ctx.request_id(),
                http.path = request.uri().path(),
                location = %location,
                "redirecting to canonical path"
            );
            Response::redirect(status, &location)
        })
    }
}
