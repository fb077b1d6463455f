//! # Keel
//!
//! The composition core of a web application runtime:
//!
//! - a lazy **service registry** with singleton and transient lifetimes,
//!   aliases, cycle detection, and factories that branch on the execution
//!   context (web worker or console)
//! - an **extension event bus** with three build phases that core code and
//!   plugins contribute to: `build-console-commands`, `build-routes`, and
//!   `build-view`
//! - a fixed-order **request pipeline**
//! - a cache-backed fixed-window **rate limiter**
//!
//! ## Frame order
//!
//! ```text
//! Request → ErrorHandling → Session → RemoveTrailingSlash → ForwardedProto
//!         → InjectRateLimit → InjectRouter → BodyParsing → Routing
//!         → application middleware → handler
//! ```
//!
//! Responses travel back out through the same frames in reverse.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use keel::prelude::*;
//!
//! async fn hello(ctx: RequestContext, _req: Request) -> KeelResult<Response> {
//!     let name = ctx.param("name").unwrap_or("world");
//!     Ok(Response::text(StatusCode::OK, format!("hello {name}")))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = ConfigLoader::new()
//!         .with_optional_file("config/app.toml")?
//!         .with_env_prefix("APP")
//!         .with_dotenv()
//!         .load()?;
//!
//!     let app = App::builder(settings)
//!         .routes(|routes, _registry| {
//!             routes.get("/hello/{name}", hello).named("hello");
//!             Ok(())
//!         })
//!         .build()?;
//!     app.init_telemetry()?;
//!     app.serve().await?;
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/keel/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod app;
pub mod defaults;
pub mod server;
pub mod services;
pub mod shutdown;

pub use app::{App, AppBuilder};
pub use defaults::{AppHooks, CoreSubscriber};
pub use server::{Server, ServerError};
pub use services::{keys, register_defaults, HttpClient};
pub use shutdown::ShutdownSignal;

pub use keel_cache as cache;
pub use keel_config as config;
pub use keel_core as core;
pub use keel_events as events;
pub use keel_middleware as middleware;
pub use keel_telemetry as telemetry;

/// Common imports.
pub mod prelude {
    pub use crate::{keys, App, AppBuilder, HttpClient, ShutdownSignal};
    pub use http::StatusCode;
    pub use keel_config::{ConfigLoader, Settings};
    pub use keel_core::{ExecutionContext, KeelError, KeelResult, Registry};
    pub use keel_events::{
        BuildConsoleCommands, BuildRoutes, BuildView, CommandSet, EventBus, Subscriber,
        ViewContext, DEFAULT_PRIORITY,
    };
    pub use keel_middleware::{
        Middleware, MiddlewareContext, MiddlewareResult, Next, Request, RequestContext, Response,
        ResponseExt, RouteBuilder, Session, Stage,
    };
}
