//! Route table and handlers.
//!
//! Paths use `matchit` syntax: `/users/{id}` captures one segment and
//! `/files/{*path}` captures the rest. One tree is kept per method, so a path
//! that matches under another method can be reported as "method not allowed"
//! rather than "not found".

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use http::Method;
use keel_core::{KeelError, KeelResult};
use matchit::Router as MatchitRouter;

use crate::context::RequestContext;
use crate::middleware::BoxFuture;
use crate::types::{MiddlewareResult, Request};

/// A route handler.
///
/// Implemented for every `Fn(RequestContext, Request) -> impl Future` so plain
/// async closures can be registered directly.
pub trait Handler: Send + Sync + 'static {
    /// Handles a matched request.
    fn call(&self, ctx: RequestContext, request: Request) -> BoxFuture<'static, MiddlewareResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(RequestContext, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MiddlewareResult> + Send + 'static,
{
    fn call(&self, ctx: RequestContext, request: Request) -> BoxFuture<'static, MiddlewareResult> {
        Box::pin(self(ctx, request))
    }
}

/// A type-erased, shareable handler.
pub type BoxedHandler = Arc<dyn Handler>;

/// A registered route.
#[derive(Clone)]
pub struct Route {
    /// HTTP method.
    pub method: Method,
    /// Path pattern.
    pub pattern: String,
    /// Optional name for URL generation.
    pub name: Option<String>,
    /// The handler.
    pub handler: BoxedHandler,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Path parameters captured by a match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteParams(Vec<(String, String)>);

impl RouteParams {
    /// A parameter by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Iterates over `(name, value)` pairs in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of captured parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The route chosen for a request, stored in the context by the routing frame.
#[derive(Clone)]
pub struct MatchedRoute {
    /// Route name, if any.
    pub name: Option<String>,
    /// The pattern that matched.
    pub pattern: String,
    /// Captured path parameters.
    pub params: RouteParams,
    /// The handler to run.
    pub handler: BoxedHandler,
}

impl fmt::Debug for MatchedRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchedRoute")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
impl MatchedRoute {
    pub(crate) fn for_test(name: Option<&str>, params: &[(&str, &str)]) -> Self {
        Self {
            name: name.map(ToString::to_string),
            pattern: "/test".to_string(),
            params: RouteParams(
                params
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
            handler: Arc::new(|_ctx: RequestContext, _req: Request| async {
                Ok::<_, KeelError>(crate::types::Response::new(http_body_util::Full::default()))
            }),
        }
    }
}

/// Result of looking up a request in the table.
#[derive(Debug)]
pub enum RouteLookup {
    /// A route matched.
    Matched(MatchedRoute),
    /// The path exists under other methods only.
    MethodNotAllowed(Vec<String>),
    /// Nothing matches the path.
    NotFound,
}

/// The finalized, immutable set of routes.
pub struct RouteTable {
    routes: Vec<Route>,
    trees: HashMap<Method, MatchitRouter<usize>>,
    names: HashMap<String, usize>,
}

impl RouteTable {
    /// Builds a table, rejecting duplicate routes and duplicate names.
    pub fn new(routes: Vec<Route>) -> KeelResult<Self> {
        let mut trees: HashMap<Method, MatchitRouter<usize>> = HashMap::new();
        let mut names = HashMap::new();

        for (index, route) in routes.iter().enumerate() {
            trees
                .entry(route.method.clone())
                .or_default()
                .insert(route.pattern.clone(), index)
                .map_err(|e| {
                    KeelError::internal_with_source(
                        format!("cannot register {} {}", route.method, route.pattern),
                        e,
                    )
                })?;

            if let Some(name) = &route.name {
                if names.insert(name.clone(), index).is_some() {
                    return Err(KeelError::internal(format!(
                        "route name {name} is registered twice"
                    )));
                }
            }
        }

        Ok(Self {
            routes,
            trees,
            names,
        })
    }

    /// Finds the route for `method` and `path`.
    ///
    /// `HEAD` falls back to `GET` routes.
    pub fn lookup(&self, method: &Method, path: &str) -> RouteLookup {
        let found = self.find(method, path).or_else(|| {
            (method == Method::HEAD)
                .then(|| self.find(&Method::GET, path))
                .flatten()
        });
        if let Some(matched) = found {
            return RouteLookup::Matched(matched);
        }

        let mut allowed: Vec<String> = self
            .trees
            .iter()
            .filter(|(_, tree)| tree.at(path).is_ok())
            .map(|(method, _)| method.to_string())
            .collect();
        if allowed.is_empty() {
            return RouteLookup::NotFound;
        }
        allowed.sort();
        RouteLookup::MethodNotAllowed(allowed)
    }

    fn find(&self, method: &Method, path: &str) -> Option<MatchedRoute> {
        let matched = self.trees.get(method)?.at(path).ok()?;
        let route = &self.routes[*matched.value];
        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Some(MatchedRoute {
            name: route.name.clone(),
            pattern: route.pattern.clone(),
            params: RouteParams(params),
            handler: Arc::clone(&route.handler),
        })
    }

    /// Builds the path of a named route.
    ///
    /// Parameters not used by the pattern are ignored.
    pub fn url_for(&self, name: &str, params: &[(&str, &str)]) -> KeelResult<String> {
        let index = self
            .names
            .get(name)
            .ok_or_else(|| KeelError::internal(format!("no route named {name}")))?;
        let pattern = &self.routes[*index].pattern;

        let mut url = String::with_capacity(pattern.len());
        let mut rest = pattern.as_str();
        while let Some(open) = rest.find('{') {
            url.push_str(&rest[..open]);
            let close = rest[open..]
                .find('}')
                .map(|offset| open + offset)
                .ok_or_else(|| KeelError::internal(format!("malformed pattern {pattern}")))?;
            let key = rest[open + 1..close].trim_start_matches('*');
            let value = params
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| *v)
                .ok_or_else(|| {
                    KeelError::internal(format!("route {name} needs parameter {key}"))
                })?;
            url.push_str(value);
            rest = &rest[close + 1..];
        }
        url.push_str(rest);
        Ok(url)
    }

    /// Named routes as `(name, pattern)` pairs, sorted by name.
    #[must_use]
    pub fn named_routes(&self) -> Vec<(&str, &str)> {
        let mut named: Vec<_> = self
            .names
            .iter()
            .map(|(name, index)| (name.as_str(), self.routes[*index].pattern.as_str()))
            .collect();
        named.sort_unstable();
        named
    }

    /// Every route in registration order.
    #[must_use]
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Number of routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` if the table has no routes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Response, ResponseExt};
    use http::StatusCode;

    fn route(method: Method, pattern: &str, name: Option<&str>) -> Route {
        Route {
            method,
            pattern: pattern.to_string(),
            name: name.map(ToString::to_string),
            handler: Arc::new(|_ctx: RequestContext, _req: Request| async {
                Ok::<_, KeelError>(Response::text(StatusCode::OK, "ok"))
            }),
        }
    }

    fn table() -> RouteTable {
        RouteTable::new(vec![
            route(Method::GET, "/", Some("home")),
            route(Method::GET, "/users/{id}", Some("user.show")),
            route(Method::POST, "/users", Some("user.create")),
            route(Method::GET, "/files/{*path}", Some("files")),
        ])
        .unwrap()
    }

    #[test]
    fn test_match_with_params() {
        match table().lookup(&Method::GET, "/users/42") {
            RouteLookup::Matched(matched) => {
                assert_eq!(matched.name.as_deref(), Some("user.show"));
                assert_eq!(matched.pattern, "/users/{id}");
                assert_eq!(matched.params.get("id"), Some("42"));
            }
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn test_head_falls_back_to_get() {
        assert!(matches!(
            table().lookup(&Method::HEAD, "/"),
            RouteLookup::Matched(_)
        ));
    }

    #[test]
    fn test_method_not_allowed_lists_methods() {
        match table().lookup(&Method::DELETE, "/users") {
            RouteLookup::MethodNotAllowed(allowed) => assert_eq!(allowed, vec!["POST"]),
            other => panic!("expected 405, got {other:?}"),
        }
    }

    #[test]
    fn test_not_found() {
        assert!(matches!(
            table().lookup(&Method::GET, "/missing"),
            RouteLookup::NotFound
        ));
    }

    #[test]
    fn test_url_for() {
        let table = table();
        assert_eq!(table.url_for("home", &[]).unwrap(), "/");
        assert_eq!(
            table.url_for("user.show", &[("id", "7"), ("extra", "x")]).unwrap(),
            "/users/7"
        );
        assert_eq!(
            table.url_for("files", &[("path", "a/b.txt")]).unwrap(),
            "/files/a/b.txt"
        );
        assert!(table.url_for("user.show", &[]).is_err());
        assert!(table.url_for("nope", &[]).is_err());
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let result = RouteTable::new(vec![
            route(Method::GET, "/a", None),
            route(Method::GET, "/a", None),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = RouteTable::new(vec![
            route(Method::GET, "/a", Some("same")),
            route(Method::GET, "/b", Some("same")),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_named_routes_sorted() {
        let table = table();
        let named = table.named_routes();
        assert_eq!(named[0], ("files", "/files/{*path}"));
        assert_eq!(named.len(), 4);
    }
}
