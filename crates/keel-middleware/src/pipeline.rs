//! Fixed-order middleware pipeline.
//!
//! A [`RouteBuilder`] collects routes, standard frames, and application
//! middleware while the application starts. [`RouteBuilder::build`] freezes
//! them into a [`Pipeline`] whose frame order never changes afterwards:
//!
//! | # | Stage | Installed by |
//! |---|-------|--------------|
//! | 1 | [`Stage::ErrorHandling`] | [`RouteBuilder::install`] |
//! | 2 | [`Stage::Session`] | [`RouteBuilder::install`] |
//! | 3 | [`Stage::RemoveTrailingSlash`] | [`RouteBuilder::install`] |
//! | 4 | [`Stage::ForwardedProto`] | [`RouteBuilder::install`] |
//! | 5 | [`Stage::InjectRateLimit`] | [`RouteBuilder::install`] |
//! | 6 | [`Stage::InjectRouter`] | always, by `build` |
//! | 7 | [`Stage::BodyParsing`] | [`RouteBuilder::install`] |
//! | 8 | [`Stage::Routing`] | always, by `build` |
//! | 9 | [`Stage::Application`] | [`RouteBuilder::add_middleware`], in call order |
//!
//! Stages that were never installed are simply absent; the remaining ones
//! keep their relative order.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use http::header::HeaderValue;
use http::Method;
use keel_core::{KeelError, KeelResult};
use tracing::info;

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, BoxedMiddleware, Endpoint, Middleware, Next};
use crate::routing::{Handler, MatchedRoute, Route, RouteTable};
use crate::stages::error_handling::ErrorHandlingMiddleware;
use crate::stages::inject_router::InjectRouterMiddleware;
use crate::stages::routing::RoutingMiddleware;
use crate::types::{MiddlewareResult, Request, Response};

/// Header carrying the request ID on every response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// A position in the frame order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Stage {
    /// Catches failures from everything inside it.
    ErrorHandling = 1,
    /// Loads and persists the session.
    Session = 2,
    /// Redirects paths with trailing slashes.
    RemoveTrailingSlash = 3,
    /// Honors forwarding headers from trusted proxies.
    ForwardedProto = 4,
    /// Attaches the rate limiter.
    InjectRateLimit = 5,
    /// Attaches the router handle.
    InjectRouter = 6,
    /// Decodes the body.
    BodyParsing = 7,
    /// Matches the route.
    Routing = 8,
    /// Application middleware.
    Application = 9,
}

impl Stage {
    /// Every stage, outermost first.
    #[must_use]
    pub const fn all() -> [Stage; 9] {
        [
            Stage::ErrorHandling,
            Stage::Session,
            Stage::RemoveTrailingSlash,
            Stage::ForwardedProto,
            Stage::InjectRateLimit,
            Stage::InjectRouter,
            Stage::BodyParsing,
            Stage::Routing,
            Stage::Application,
        ]
    }

    /// The stage's name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Stage::ErrorHandling => "error_handling",
            Stage::Session => "session",
            Stage::RemoveTrailingSlash => "remove_trailing_slash",
            Stage::ForwardedProto => "forwarded_proto",
            Stage::InjectRateLimit => "inject_rate_limit",
            Stage::InjectRouter => "inject_router",
            Stage::BodyParsing => "body_parsing",
            Stage::Routing => "routing",
            Stage::Application => "application",
        }
    }

    /// Whether `build` provides this stage itself.
    #[must_use]
    pub const fn is_built_in(self) -> bool {
        matches!(self, Stage::InjectRouter | Stage::Routing)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Collects routes and middleware until the pipeline is built.
///
/// This is the payload of the `build-routes` phase.
///
/// ```
/// use keel_middleware::{Request, RequestContext, Response, ResponseExt, RouteBuilder};
/// use http::StatusCode;
///
/// let mut routes = RouteBuilder::new();
/// routes
///     .get("/", |_ctx: RequestContext, _req: Request| async {
///         Ok::<_, keel_core::KeelError>(Response::text(StatusCode::OK, "home"))
///     })
///     .named("home");
///
/// let pipeline = routes.build().unwrap();
/// assert_eq!(pipeline.stage_names(), vec!["inject_router", "routing"]);
/// ```
#[derive(Default)]
pub struct RouteBuilder {
    routes: Vec<Route>,
    stages: BTreeMap<Stage, BoxedMiddleware>,
    application: Vec<BoxedMiddleware>,
    deferred_error: Option<KeelError>,
}

impl RouteBuilder {
    /// An empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a route.
    pub fn route<H: Handler>(&mut self, method: Method, pattern: &str, handler: H) -> &mut Self {
        self.routes.push(Route {
            method,
            pattern: pattern.to_string(),
            name: None,
            handler: Arc::new(handler),
        });
        self
    }

    /// Adds a `GET` route.
    pub fn get<H: Handler>(&mut self, pattern: &str, handler: H) -> &mut Self {
        self.route(Method::GET, pattern, handler)
    }

    /// Adds a `POST` route.
    pub fn post<H: Handler>(&mut self, pattern: &str, handler: H) -> &mut Self {
        self.route(Method::POST, pattern, handler)
    }

    /// Adds a `PUT` route.
    pub fn put<H: Handler>(&mut self, pattern: &str, handler: H) -> &mut Self {
        self.route(Method::PUT, pattern, handler)
    }

    /// Adds a `PATCH` route.
    pub fn patch<H: Handler>(&mut self, pattern: &str, handler: H) -> &mut Self {
        self.route(Method::PATCH, pattern, handler)
    }

    /// Adds a `DELETE` route.
    pub fn delete<H: Handler>(&mut self, pattern: &str, handler: H) -> &mut Self {
        self.route(Method::DELETE, pattern, handler)
    }

    /// Names the most recently added route.
    ///
    /// Calling this before any route is added makes [`build`](Self::build) fail.
    pub fn named(&mut self, name: &str) -> &mut Self {
        match self.routes.last_mut() {
            Some(route) => route.name = Some(name.to_string()),
            None => {
                self.deferred_error.get_or_insert_with(|| {
                    KeelError::internal(format!("route name {name} given before any route"))
                });
            }
        }
        self
    }

    /// Adds application middleware, run after routing in call order.
    pub fn add_middleware<M: Middleware>(&mut self, middleware: M) -> &mut Self {
        self.application.push(Arc::new(middleware));
        self
    }

    /// Installs a standard frame at `stage`.
    ///
    /// # Errors
    ///
    /// `Internal` if the stage is built in, is [`Stage::Application`], or
    /// already has a frame.
    pub fn install<M: Middleware>(&mut self, stage: Stage, middleware: M) -> KeelResult<&mut Self> {
        if stage.is_built_in() || stage == Stage::Application {
            return Err(KeelError::internal(format!(
                "stage {stage} cannot be installed directly"
            )));
        }
        if self.stages.contains_key(&stage) {
            return Err(KeelError::internal(format!("stage {stage} is already installed")));
        }
        self.stages.insert(stage, Arc::new(middleware));
        Ok(self)
    }

    /// Whether a frame is installed at `stage`.
    #[must_use]
    pub fn has_stage(&self, stage: Stage) -> bool {
        stage.is_built_in() || self.stages.contains_key(&stage)
    }

    /// Number of routes added so far.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Freezes routes and frames into a pipeline.
    pub fn build(self) -> KeelResult<Pipeline> {
        if let Some(err) = self.deferred_error {
            return Err(err);
        }
        let table = Arc::new(RouteTable::new(self.routes)?);

        let mut stages = self.stages;
        stages.insert(
            Stage::InjectRouter,
            Arc::new(InjectRouterMiddleware::new(Arc::clone(&table))),
        );
        stages.insert(
            Stage::Routing,
            Arc::new(RoutingMiddleware::new(Arc::clone(&table))),
        );

        let frames: Vec<BoxedMiddleware> = stages
            .into_values()
            .chain(self.application)
            .collect();

        Ok(Pipeline {
            frames,
            endpoint: RouteDispatch,
            table,
        })
    }
}

impl fmt::Debug for RouteBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteBuilder")
            .field("routes", &self.routes)
            .field("stages", &self.stages.keys().collect::<Vec<_>>())
            .field("application", &self.application.len())
            .finish()
    }
}

/// Runs the handler of the matched route.
struct RouteDispatch;

impl Endpoint for RouteDispatch {
    fn call<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            let matched = ctx
                .get_extension::<MatchedRoute>()
                .cloned()
                .ok_or_else(|| KeelError::internal("request reached dispatch without a route"))?;
            let request_ctx = ctx.to_request_context(&matched);
            matched.handler.call(request_ctx, request).await
        })
    }
}

/// The assembled, immutable request pipeline.
pub struct Pipeline {
    frames: Vec<BoxedMiddleware>,
    endpoint: RouteDispatch,
    table: Arc<RouteTable>,
}

impl Pipeline {
    /// Runs one request through every frame.
    ///
    /// Never fails: an error that escapes every frame is rendered here.
    pub async fn handle(&self, request: Request, client_addr: Option<SocketAddr>) -> Response {
        let mut ctx = MiddlewareContext::new(client_addr);
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        let mut response = match Next::new(&self.frames, &self.endpoint)
            .run(&mut ctx, request)
            .await
        {
            Ok(response) => response,
            Err(err) => ErrorHandlingMiddleware::new(false).render(&ctx, &err),
        };

        let request_id = ctx.request_id().to_string();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        let elapsed = ctx.elapsed();
        keel_telemetry::metrics::record_request(response.status().as_u16(), elapsed);
        info!(
            request_id = %request_id,
            http.method = %method,
            http.path = %path,
            http.status = response.status().as_u16(),
            duration_ms = elapsed.as_millis() as u64,
            "request completed"
        );
        response
    }

    /// Frame names, outermost first.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.frames.iter().map(|frame| frame.name()).collect()
    }

    /// Number of frames.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.frames.len()
    }

    /// The route table.
    #[must_use]
    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.table
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("frames", &self.stage_names())
            .field("routes", &self.table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::stages::{BodyParsingMiddleware, RemoveTrailingSlashMiddleware};
    use crate::test_support::request;
    use crate::types::ResponseExt;
    use http::StatusCode;

    async fn hello(_ctx: RequestContext, _req: Request) -> MiddlewareResult {
        Ok(Response::text(StatusCode::OK, "hello"))
    }

    struct Tag(&'static str);

    impl Middleware for Tag {
        fn name(&self) -> &'static str {
            self.0
        }

        fn process<'a>(
            &'a self,
            ctx: &'a mut MiddlewareContext,
            request: Request,
            next: Next<'a>,
        ) -> BoxFuture<'a, MiddlewareResult> {
            Box::pin(next.run(ctx, request))
        }
    }

    #[test]
    fn test_stage_order_is_numeric() {
        let all = Stage::all();
        assert!(all.windows(2).all(|pair| (pair[0] as u8) < (pair[1] as u8)));
        assert_eq!(Stage::Routing.to_string(), "routing");
    }

    #[test]
    fn test_frames_sorted_regardless_of_install_order() {
        let mut builder = RouteBuilder::new();
        builder.add_middleware(Tag("audit"));
        builder.install(Stage::BodyParsing, BodyParsingMiddleware::new()).unwrap();
        builder
            .install(Stage::RemoveTrailingSlash, RemoveTrailingSlashMiddleware::new())
            .unwrap();
        builder.add_middleware(Tag("tenant"));

        let pipeline = builder.build().unwrap();
        assert_eq!(
            pipeline.stage_names(),
            vec![
                "remove_trailing_slash",
                "inject_router",
                "body_parsing",
                "routing",
                "audit",
                "tenant"
            ]
        );
    }

    #[test]
    fn test_install_rejects_built_in_and_duplicates() {
        let mut builder = RouteBuilder::new();
        assert!(builder.install(Stage::Routing, Tag("x")).is_err());
        assert!(builder.install(Stage::Application, Tag("x")).is_err());

        builder.install(Stage::Session, Tag("x")).unwrap();
        assert!(builder.install(Stage::Session, Tag("y")).is_err());
        assert!(builder.has_stage(Stage::Session));
        assert!(builder.has_stage(Stage::Routing));
        assert!(!builder.has_stage(Stage::ErrorHandling));
    }

    #[test]
    fn test_named_before_route_fails_build() {
        let mut builder = RouteBuilder::new();
        builder.named("orphan");
        builder.get("/", hello);
        assert!(builder.build().is_err());
    }

    #[tokio::test]
    async fn test_handle_sets_request_id_header() {
        let mut builder = RouteBuilder::new();
        builder.get("/", hello).named("home");
        assert_eq!(builder.route_count(), 1);

        let pipeline = builder.build().unwrap();
        let response = pipeline.handle(request("GET", "/"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        assert_eq!(pipeline.routes().url_for("home", &[]).unwrap(), "/");
    }

    #[tokio::test]
    async fn test_handler_error_without_error_frame_still_renders() {
        let mut builder = RouteBuilder::new();
        builder.get("/fail", |_ctx: RequestContext, _req: Request| async {
            Err::<Response, _>(KeelError::internal("boom"))
        });

        let response = builder.build().unwrap().handle(request("GET", "/fail"), None).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
