//! The standard frames.
//!
//! Listed outermost first, which is also the order they run in:
//!
//! 1. [`error_handling`] - renders failures and panics as error envelopes
//! 2. [`session`] - loads the session, persists it on the way out
//! 3. [`remove_slashes`] - redirects non-canonical paths
//! 4. [`forwarded_proto`] - honors forwarding headers from trusted proxies
//! 5. [`inject_rate_limit`] - attaches the rate limiter, applies the global policy
//! 6. [`inject_router`] - attaches the router handle
//! 7. [`body_parsing`] - decodes the body
//! 8. [`routing`] - matches the route or answers 404/405
//!
//! Application middleware runs after routing, immediately before the handler.

pub mod body_parsing;
pub mod error_handling;
pub mod forwarded_proto;
pub mod inject_rate_limit;
pub mod inject_router;
pub mod remove_slashes;
pub mod routing;
pub mod session;

pub use body_parsing::{BodyParsingMiddleware, ParsedBody};
pub use error_handling::ErrorHandlingMiddleware;
pub use forwarded_proto::ForwardedProtoMiddleware;
pub use inject_rate_limit::{InjectRateLimitMiddleware, RateLimitHandle, RateLimitPolicy};
pub use inject_router::{InjectRouterMiddleware, RouterHandle};
pub use remove_slashes::RemoveTrailingSlashMiddleware;
pub use routing::RoutingMiddleware;
pub use session::SessionMiddleware;
