//! # Keel Middleware
//!
//! The request pipeline: an ordered chain of frames, assembled once per
//! application and traversed once per request.
//!
//! ```text
//! Request → ErrorHandling → Session → RemoveTrailingSlash → ForwardedProto
//!         → InjectRateLimit → InjectRouter → BodyParsing → Routing
//!         → application middleware → Handler
//! ```
//!
//! Responses flow back out through the same frames in reverse, so the
//! session frame persists mutations and the error-handling frame renders any
//! failure from further in.
//!
//! ## Example
//!
//! ```
//! use keel_middleware::pipeline::Stage;
//!
//! let stages = Stage::all();
//! assert_eq!(stages[0].name(), "error_handling");
//! assert_eq!(stages[7].name(), "routing");
//! ```

#![doc(html_root_url = "https://docs.rs/keel-middleware/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod context;
pub mod middleware;
pub mod pipeline;
pub mod routing;
pub mod session;
pub mod stages;
pub mod types;

#[cfg(test)]
mod test_support;

pub use context::{MiddlewareContext, RequestContext};
pub use middleware::{BoxFuture, BoxedMiddleware, Endpoint, Middleware, Next};
pub use pipeline::{Pipeline, RouteBuilder, Stage, REQUEST_ID_HEADER};
pub use routing::{Handler, MatchedRoute, RouteParams, RouteTable};
pub use session::{Session, SessionStore};
pub use stages::{ParsedBody, RateLimitHandle, RateLimitPolicy, RouterHandle};
pub use types::{MiddlewareResult, Request, Response, ResponseExt};
