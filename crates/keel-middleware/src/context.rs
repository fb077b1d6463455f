//! Per-request state.
//!
//! [`MiddlewareContext`] is the attribute bag that frames read and write
//! while the request travels inward. Once routing has matched, it is turned
//! into an owned [`RequestContext`] and handed to the route handler.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::routing::{MatchedRoute, RouteParams};
use crate::session::Session;
use crate::stages::body_parsing::ParsedBody;
use crate::stages::inject_rate_limit::RateLimitHandle;
use crate::stages::inject_router::RouterHandle;

/// Context that flows through the middleware pipeline.
///
/// # Example
///
/// ```
/// use keel_middleware::MiddlewareContext;
///
/// #[derive(Debug, PartialEq)]
/// struct Tenant(&'static str);
///
/// let mut ctx = MiddlewareContext::new(None);
/// ctx.set_extension(Tenant("acme"));
/// assert_eq!(ctx.get_extension::<Tenant>(), Some(&Tenant("acme")));
/// ```
#[derive(Debug)]
pub struct MiddlewareContext {
    request_id: Uuid,
    client_addr: Option<SocketAddr>,
    client_ip: Option<IpAddr>,
    started_at: Instant,
    extensions: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl MiddlewareContext {
    /// Creates a context for a request arriving from `client_addr`.
    #[must_use]
    pub fn new(client_addr: Option<SocketAddr>) -> Self {
        Self {
            request_id: Uuid::now_v7(),
            client_addr,
            client_ip: None,
            started_at: Instant::now(),
            extensions: HashMap::new(),
        }
    }

    /// The request ID (UUID v7).
    #[must_use]
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// The transport peer address, if known.
    #[must_use]
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    /// The client IP: the forwarded address when a trusted proxy supplied
    /// one, otherwise the peer address.
    #[must_use]
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip.or_else(|| self.client_addr.map(|addr| addr.ip()))
    }

    /// Overrides the client IP.
    ///
    /// Only the forwarded-proto frame calls this, after checking that the
    /// peer is a trusted proxy.
    pub fn set_client_ip(&mut self, ip: IpAddr) {
        self.client_ip = Some(ip);
    }

    /// Key identifying the client for rate limiting.
    #[must_use]
    pub fn client_key(&self) -> String {
        self.client_ip()
            .map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
    }

    /// Time since the context was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Stores a typed extension value, replacing any previous value of `T`.
    pub fn set_extension<T: Send + Sync + 'static>(&mut self, value: T) {
        self.extensions.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Retrieves a typed extension value.
    #[must_use]
    pub fn get_extension<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref())
    }

    /// Removes and returns a typed extension value.
    pub fn remove_extension<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.extensions
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast().ok())
            .map(|b| *b)
    }

    /// Checks if an extension of the given type exists.
    #[must_use]
    pub fn has_extension<T: Send + Sync + 'static>(&self) -> bool {
        self.extensions.contains_key(&TypeId::of::<T>())
    }

    /// Builds the handler-facing context from the attributes gathered so far.
    #[must_use]
    pub fn to_request_context(&self, route: &MatchedRoute) -> RequestContext {
        RequestContext {
            request_id: self.request_id,
            client_ip: self.client_ip(),
            route_name: route.name.clone(),
            params: route.params.clone(),
            session: self.get_extension::<Session>().cloned(),
            router: self.get_extension::<RouterHandle>().cloned(),
            rate_limit: self.get_extension::<RateLimitHandle>().cloned(),
            body: self.get_extension::<ParsedBody>().cloned().unwrap_or_default(),
        }
    }
}

/// What a route handler sees of the request's attributes.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: Uuid,
    client_ip: Option<IpAddr>,
    route_name: Option<String>,
    params: RouteParams,
    session: Option<Session>,
    router: Option<RouterHandle>,
    rate_limit: Option<RateLimitHandle>,
    body: ParsedBody,
}

impl RequestContext {
    /// The request ID.
    #[must_use]
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// The client IP, if known.
    #[must_use]
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    /// Name of the matched route, if it has one.
    #[must_use]
    pub fn route_name(&self) -> Option<&str> {
        self.route_name.as_deref()
    }

    /// A path parameter by name.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    /// All path parameters.
    #[must_use]
    pub fn params(&self) -> &RouteParams {
        &self.params
    }

    /// The session, when the session frame is installed.
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// The router handle, for URL generation.
    #[must_use]
    pub fn router(&self) -> Option<&RouterHandle> {
        self.router.as_ref()
    }

    /// The rate-limiter handle bound to this client.
    #[must_use]
    pub fn rate_limit(&self) -> Option<&RateLimitHandle> {
        self.rate_limit.as_ref()
    }

    /// The parsed request body.
    #[must_use]
    pub fn body(&self) -> &ParsedBody {
        &self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extensions() {
        #[derive(Debug, Clone, PartialEq)]
        struct Marker {
            value: i32,
        }

        let mut ctx = MiddlewareContext::new(None);
        assert!(!ctx.has_extension::<Marker>());

        ctx.set_extension(Marker { value: 42 });
        assert!(ctx.has_extension::<Marker>());
        assert_eq!(ctx.get_extension::<Marker>(), Some(&Marker { value: 42 }));

        assert_eq!(ctx.remove_extension::<Marker>(), Some(Marker { value: 42 }));
        assert!(!ctx.has_extension::<Marker>());
    }

    #[test]
    fn test_client_ip_prefers_forwarded_address() {
        let peer: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        let mut ctx = MiddlewareContext::new(Some(peer));
        assert_eq!(ctx.client_key(), "10.0.0.2");

        ctx.set_client_ip("203.0.113.9".parse().unwrap());
        assert_eq!(ctx.client_ip(), Some("203.0.113.9".parse().unwrap()));
        assert_eq!(ctx.client_addr(), Some(peer));
    }

    #[test]
    fn test_unknown_client_key() {
        assert_eq!(MiddlewareContext::new(None).client_key(), "unknown");
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = MiddlewareContext::new(None);
        let b = MiddlewareContext::new(None);
        assert_ne!(a.request_id(), b.request_id());
        assert_eq!(a.request_id().get_version_num(), 7);
    }

    #[test]
    fn test_to_request_context_carries_attributes() {
        let mut ctx = MiddlewareContext::new(None);
        ctx.set_extension(ParsedBody::Form(vec![("q".into(), "rust".into())]));

        let route = MatchedRoute::for_test(Some("search"), &[("page", "2")]);
        let req_ctx = ctx.to_request_context(&route);

        assert_eq!(req_ctx.request_id(), ctx.request_id());
        assert_eq!(req_ctx.route_name(), Some("search"));
        assert_eq!(req_ctx.param("page"), Some("2"));
        assert_eq!(req_ctx.body().field("q").as_deref(), Some("rust"));
        assert!(req_ctx.session().is_none());
    }
}
