//! Scheme and client-address rewriting behind trusted proxies.
//!
//! Only requests whose transport peer is listed in `http.trusted_proxies`
//! are trusted. For those, `X-Forwarded-Proto` replaces the request URI's
//! scheme (with `Host` as the authority), and the right-most untrusted hop in
//! `X-Forwarded-For` becomes the client IP. Requests from anyone else pass
//! through unchanged.

use std::net::IpAddr;

use http::uri::{Parts, Scheme};
use http::{header, HeaderMap, Uri};
use tracing::debug;

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::types::{MiddlewareResult, Request};

const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Honors forwarding headers from trusted proxies.
#[derive(Debug, Clone, Default)]
pub struct ForwardedProtoMiddleware {
    trusted: Vec<IpAddr>,
}

impl ForwardedProtoMiddleware {
    /// Trusts the given proxy addresses.
    #[must_use]
    pub fn new(trusted: Vec<IpAddr>) -> Self {
        Self { trusted }
    }

    fn is_trusted(&self, ip: IpAddr) -> bool {
        self.trusted.contains(&ip)
    }

    fn forwarded_client(&self, headers: &HeaderMap) -> Option<IpAddr> {
        let hops: Vec<IpAddr> = headers
            .get_all(X_FORWARDED_FOR)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .filter_map(|hop| hop.trim().parse().ok())
            .collect();
        hops.iter()
            .rev()
            .find(|ip| !self.is_trusted(**ip))
            .or_else(|| hops.first())
            .copied()
    }
}

fn forwarded_scheme(headers: &HeaderMap) -> Option<Scheme> {
    let value = headers.get(X_FORWARDED_PROTO)?.to_str().ok()?;
    match value.split(',').next()?.trim().to_ascii_lowercase().as_str() {
        "https" => Some(Scheme::HTTPS),
        "http" => Some(Scheme::HTTP),
        _ => None,
    }
}

fn rewrite_uri(uri: &Uri, scheme: Scheme, headers: &HeaderMap) -> Option<Uri> {
    let authority = match uri.authority() {
        Some(authority) => authority.clone(),
        None => headers.get(header::HOST)?.to_str().ok()?.parse().ok()?,
    };
    let mut parts = Parts::default();
    parts.scheme = Some(scheme);
    parts.authority = Some(authority);
    parts.path_and_query = uri.path_and_query().cloned();
    Uri::from_parts(parts).ok()
}

impl Middleware for ForwardedProtoMiddleware {
    fn name(&self) -> &'static str {
        "forwarded_proto"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        mut request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            let peer_trusted = ctx
                .client_addr()
                .is_some_and(|addr| self.is_trusted(addr.ip()));
            if !peer_trusted {
                return next.run(ctx, request).await;
            }

            if let Some(scheme) = forwarded_scheme(request.headers()) {
                match rewrite_uri(request.uri(), scheme, request.headers()) {
                    Some(uri) => *request.uri_mut() = uri,
                    None => debug!(request_id = %ctx.request_id(), "forwarded proto ignored: no usable host"),
                }
            }
            if let Some(ip) = self.forwarded_client(request.headers()) {
                ctx.set_client_ip(ip);
            }

            next.run(ctx, request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::BoxedMiddleware;
    use crate::test_support::{request, run_from, OkEndpoint, SeenUri};
    use http::HeaderValue;
    use std::net::SocketAddr;
    use std::sync::Arc;

    const PROXY: &str = "10.0.0.1:443";

    fn frames() -> Vec<BoxedMiddleware> {
        vec![Arc::new(ForwardedProtoMiddleware::new(vec![
            "10.0.0.1".parse().unwrap(),
        ]))]
    }

    fn forwarded_request() -> Request {
        let mut request = request("GET", "/login?next=%2F");
        let headers = request.headers_mut();
        headers.insert(header::HOST, HeaderValue::from_static("app.example.com"));
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        headers.insert(
            X_FORWARDED_FOR,
            HeaderValue::from_static("198.51.100.7, 10.0.0.1"),
        );
        request
    }

    #[tokio::test]
    async fn test_trusted_proxy_rewrites_scheme_and_client() {
        let frames = frames();
        let peer: SocketAddr = PROXY.parse().unwrap();
        let (_, ctx) = run_from(&frames, &OkEndpoint, forwarded_request(), Some(peer)).await;

        let uri = &ctx.get_extension::<SeenUri>().unwrap().0;
        assert_eq!(uri.to_string(), "https://app.example.com/login?next=%2F");
        assert_eq!(ctx.client_ip(), Some("198.51.100.7".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_untrusted_peer_is_ignored() {
        let frames = frames();
        let peer: SocketAddr = "203.0.113.5:5000".parse().unwrap();
        let (_, ctx) = run_from(&frames, &OkEndpoint, forwarded_request(), Some(peer)).await;

        let uri = &ctx.get_extension::<SeenUri>().unwrap().0;
        assert_eq!(uri.scheme(), None);
        assert_eq!(ctx.client_ip(), Some("203.0.113.5".parse().unwrap()));
    }

    #[test]
    fn test_forwarded_scheme_takes_first_value() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("HTTPS, http"));
        assert_eq!(forwarded_scheme(&headers), Some(Scheme::HTTPS));

        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("gopher"));
        assert_eq!(forwarded_scheme(&headers), None);
    }
}
