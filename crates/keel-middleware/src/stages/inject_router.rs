//! Router injection.

use std::sync::Arc;

use http::header::HOST;
use keel_core::KeelResult;

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::routing::RouteTable;
use crate::types::{MiddlewareResult, Request};

/// Read-only access to the route table for URL generation.
///
/// Carries the base URI of the current request, as seen after the
/// forwarded-proto frame, so absolute URLs point back at the public host.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    table: Arc<RouteTable>,
    base_uri: String,
}

impl RouterHandle {
    /// A handle over `table` for a request whose base URI is `base_uri`.
    #[must_use]
    pub fn new(table: Arc<RouteTable>, base_uri: impl Into<String>) -> Self {
        Self {
            table,
            base_uri: base_uri.into(),
        }
    }

    /// `scheme://host` of the current request (empty if unknown).
    #[must_use]
    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    /// Path of a named route.
    pub fn url_for(&self, name: &str, params: &[(&str, &str)]) -> KeelResult<String> {
        self.table.url_for(name, params)
    }

    /// Absolute URL of a named route.
    pub fn full_url_for(&self, name: &str, params: &[(&str, &str)]) -> KeelResult<String> {
        Ok(format!("{}{}", self.base_uri, self.url_for(name, params)?))
    }

    /// The underlying table.
    #[must_use]
    pub fn table(&self) -> &RouteTable {
        &self.table
    }
}

fn base_uri(request: &Request) -> String {
    let uri = request.uri();
    let scheme = uri.scheme_str().unwrap_or("http");
    let host = uri
        .authority()
        .map(|authority| authority.as_str().to_string())
        .or_else(|| {
            request
                .headers()
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .map(ToString::to_string)
        });
    host.map_or_else(String::new, |host| format!("{scheme}://{host}"))
}

/// Attaches a [`RouterHandle`] to every request.
#[derive(Debug, Clone)]
pub struct InjectRouterMiddleware {
    table: Arc<RouteTable>,
}

impl InjectRouterMiddleware {
    /// Injects handles over `table`.
    #[must_use]
    pub fn new(table: Arc<RouteTable>) -> Self {
        Self { table }
    }
}

impl Middleware for InjectRouterMiddleware {
    fn name(&self) -> &'static str {
        "inject_router"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            ctx.set_extension(RouterHandle::new(
                Arc::clone(&self.table),
                base_uri(&request),
            ));
            next.run(ctx, request).await
        })
    }
}
