//! Routing frame.
//!
//! Matches the request against the route table and stores the
//! [`MatchedRoute`] for the endpoint. Unmatched requests end here with a
//! 404 (or a 405 when the path exists under other methods). Those are
//! ordinary responses, not failures, so the error-handling frame never
//! reports them.

use std::sync::Arc;

use keel_core::KeelError;
use tracing::debug;

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::routing::{RouteLookup, RouteTable};
use crate::stages::error_handling::add_error_headers;
use crate::types::{MiddlewareResult, Request, Response, ResponseExt};

/// Resolves the route for each request.
#[derive(Debug, Clone)]
pub struct RoutingMiddleware {
    table: Arc<RouteTable>,
}

impl RoutingMiddleware {
    /// Routes against `table`.
    #[must_use]
    pub fn new(table: Arc<RouteTable>) -> Self {
        Self { table }
    }
}

impl Middleware for RoutingMiddleware {
    fn name(&self) -> &'static str {
        "routing"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            let method = request.method().clone();
            let path = request.uri().path().to_string();

            let err = match self.table.lookup(&method, &path) {
                RouteLookup::Matched(matched) => {
                    debug!(request_id = %ctx.request_id(), route = %matched.pattern, "route matched");
                    ctx.set_extension(matched);
                    return next.run(ctx, request).await;
                }
                RouteLookup::NotFound => KeelError::RouteNotFound {
                    method: method.to_string(),
                    path,
                },
                RouteLookup::MethodNotAllowed(allowed) => KeelError::MethodNotAllowed {
                    method: method.to_string(),
                    path,
                    allowed,
                },
            };

            debug!(request_id = %ctx.request_id(), error = %err, "no route");
            let request_id = ctx.request_id().to_string();
            let mut response = Response::from_error(&err, &err.to_envelope(Some(&request_id), false));
            add_error_headers(&mut response, &err);
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::middleware::BoxedMiddleware;
    use crate::routing::{MatchedRoute, Route};
    use crate::test_support::{body_json, request, run, OkEndpoint, SeenUri};
    use http::header::ALLOW;
    use http::{Method, StatusCode};

    fn frames() -> Vec<BoxedMiddleware> {
        let table = RouteTable::new(vec![Route {
            method: Method::GET,
            pattern: "/users/{id}".to_string(),
            name: None,
            handler: Arc::new(|_ctx: RequestContext, _req: Request| async {
                Ok::<_, KeelError>(Response::text(StatusCode::OK, "user"))
            }),
        }])
        .unwrap();
        vec![Arc::new(RoutingMiddleware::new(Arc::new(table)))]
    }

    #[tokio::test]
    async fn test_match_sets_route() {
        let frames = frames();
        let (response, ctx) = run(&frames, &OkEndpoint, request("GET", "/users/9")).await;
        assert_eq!(response.unwrap().status(), StatusCode::OK);
        assert_eq!(
            ctx.get_extension::<MatchedRoute>().unwrap().params.get("id"),
            Some("9")
        );
    }

    #[tokio::test]
    async fn test_not_found_skips_endpoint() {
        let frames = frames();
        let (response, ctx) = run(&frames, &OkEndpoint, request("GET", "/nowhere")).await;

        let response = response.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(ctx.get_extension::<SeenUri>().is_none());
        assert_eq!(body_json(response).await["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_wrong_method_is_405() {
        let frames = frames();
        let (response, _) = run(&frames, &OkEndpoint, request("DELETE", "/users/9")).await;

        let response = response.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "GET");
    }
}
