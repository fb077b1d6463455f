//! Default service descriptors.
//!
//! [`register_defaults`] only stores factories. Each one runs on first
//! resolution, so a CLI invocation that never touches the session store never
//! builds one.
//!
//! | Key | Type | Lifetime |
//! |-----|------|----------|
//! | [`keys::SETTINGS`] | [`Settings`] | singleton |
//! | [`keys::CACHE`] | [`SharedCache`] | singleton, backend chosen per execution context |
//! | [`keys::CACHE_SIMPLE`] | alias of [`keys::CACHE`] | |
//! | [`keys::REDIS`] | [`SharedCache`] | singleton, always Redis |
//! | [`keys::RATE_LIMITER`] | [`RateLimiter`] | singleton |
//! | [`keys::SESSION_STORE`] | [`SessionStore`] | singleton |
//! | [`keys::HTTP_CLIENT`] | [`HttpClient`] | singleton |
//! | [`keys::EVENTS`] | [`EventBus`] | singleton |
//! | [`keys::CONSOLE`] | [`CommandSet`] | singleton, dispatches `build-console-commands` |
//! | [`keys::VIEW`] | [`ViewContext`] | transient, dispatches `build-view` |

use std::sync::Arc;
use std::time::Duration;

use keel_cache::{select_backend, RateLimiter, RedisCache, SharedCache};
use keel_config::Settings;
use keel_core::{KeelError, KeelResult, Registry, RegistryHandle, Resolver};
use keel_events::{BuildConsoleCommands, BuildView, CommandSet, EventBus, Subscriber, ViewContext};
use keel_middleware::{RouteTable, SessionStore};
use serde_json::{Map, Value};
use tracing::debug;

use crate::defaults::{AppHooks, CoreSubscriber};

/// Well-known service keys.
pub mod keys {
    /// The loaded [`keel_config::Settings`].
    pub const SETTINGS: &str = "settings";
    /// The context-dependent cache.
    pub const CACHE: &str = "cache";
    /// Alias of [`CACHE`].
    pub const CACHE_SIMPLE: &str = "cache.simple";
    /// The shared Redis cache, regardless of execution context.
    pub const REDIS: &str = "redis";
    /// The rate limiter.
    pub const RATE_LIMITER: &str = "rate_limiter";
    /// The session store.
    pub const SESSION_STORE: &str = "session_store";
    /// The outbound HTTP client.
    pub const HTTP_CLIENT: &str = "http_client";
    /// The extension event bus.
    pub const EVENTS: &str = "events";
    /// The finalized route table, registered once the pipeline is built.
    pub const ROUTES: &str = "routes";
    /// The console command set.
    pub const CONSOLE: &str = "console";
    /// A fresh view context.
    pub const VIEW: &str = "view";
}

/// Registers the default descriptors.
///
/// `plugins` are added to the event bus after the core subscriber, in order.
pub fn register_defaults(
    registry: &Registry,
    settings: Settings,
    hooks: AppHooks,
    plugins: Vec<Arc<dyn Subscriber>>,
) {
    registry.instance(keys::SETTINGS, settings);

    registry.singleton(keys::CACHE, |r| {
        let settings = r.resolve::<Settings>(keys::SETTINGS)?;
        select_backend(r.context(), &settings.redis)
    });
    registry.alias(keys::CACHE_SIMPLE, keys::CACHE);

    registry.singleton(keys::REDIS, |r| {
        let settings = r.resolve::<Settings>(keys::SETTINGS)?;
        let cache: SharedCache = Arc::new(RedisCache::new(&settings.redis)?);
        Ok(cache)
    });

    registry.singleton(keys::RATE_LIMITER, |r| {
        Ok(RateLimiter::new(r.resolve_cloned::<SharedCache>(keys::CACHE)?))
    });

    registry.singleton(keys::SESSION_STORE, |r| {
        let settings = r.resolve::<Settings>(keys::SETTINGS)?;
        let cache = r.resolve_cloned::<SharedCache>(keys::CACHE)?;
        Ok(SessionStore::new(cache, settings.session.clone()))
    });

    registry.singleton(keys::HTTP_CLIENT, |r| {
        let settings = r.resolve::<Settings>(keys::SETTINGS)?;
        HttpClient::new(settings.http.client_timeout())
    });

    let hooks = Arc::new(hooks);
    registry.singleton(keys::EVENTS, move |r| {
        let settings = r.resolve::<Settings>(keys::SETTINGS)?;
        let bus = EventBus::new();
        bus.add_subscriber(Arc::new(CoreSubscriber::new(
            r.handle(),
            settings,
            Arc::clone(&hooks),
        )));
        for plugin in &plugins {
            bus.add_subscriber(Arc::clone(plugin));
        }
        Ok(bus)
    });

    registry.singleton(keys::CONSOLE, |r| {
        let bus = r.resolve::<EventBus>(keys::EVENTS)?;
        let mut commands = CommandSet::new();
        bus.dispatch::<BuildConsoleCommands>(&mut commands)?;
        Ok(commands)
    });

    registry.transient(keys::VIEW, build_view);
}

fn build_view(r: &Resolver<'_>) -> KeelResult<ViewContext> {
    let settings = r.resolve::<Settings>(keys::SETTINGS)?;
    let bus = r.resolve::<EventBus>(keys::EVENTS)?;

    let mut view = ViewContext::new();
    view.register_function("escape_js", escape_js);
    view.register_function("service", service_lookup(r.handle()));
    view.insert("settings", settings.as_ref())?;

    match r.resolve::<Arc<RouteTable>>(keys::ROUTES) {
        Ok(table) => {
            let named: Map<String, Value> = table
                .named_routes()
                .into_iter()
                .map(|(name, pattern)| (name.to_string(), Value::String(pattern.to_string())))
                .collect();
            view.insert("router", named)?;
        }
        Err(KeelError::UnknownService { .. }) => {
            debug!("route table not built yet, view has no router data");
        }
        Err(other) => return Err(other),
    }

    bus.dispatch::<BuildView>(&mut view)?;
    Ok(view)
}

/// JSON-encodes its first argument for embedding in a script block.
fn escape_js(args: &[Value]) -> KeelResult<Value> {
    let encoded = serde_json::to_string(args.first().unwrap_or(&Value::Null))
        .map_err(|e| KeelError::internal_with_source("cannot encode view value", e))?;
    Ok(Value::String(encoded))
}

/// The `service(key)` view function.
///
/// Resolves the key through the registry and returns the service when it is
/// stored as a JSON value or a string. Other service types cannot be shown in
/// a template and fail with `ServiceTypeMismatch`.
fn service_lookup(
    registry: RegistryHandle,
) -> impl Fn(&[Value]) -> KeelResult<Value> + Send + Sync {
    move |args| {
        let key = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| KeelError::bad_request("service() takes a service key"))?;
        match registry.resolve::<Value>(key.to_owned()) {
            Ok(value) => Ok(value.as_ref().clone()),
            Err(KeelError::ServiceTypeMismatch { .. }) => match registry.resolve::<String>(key.to_owned()) {
                Ok(text) => Ok(Value::String(text.as_ref().clone())),
                Err(KeelError::ServiceTypeMismatch { key, .. }) => {
                    Err(KeelError::ServiceTypeMismatch {
                        key,
                        expected: "a JSON value or string",
                    })
                }
                Err(other) => Err(other),
            },
            Err(other) => Err(other),
        }
    }
}

/// Outbound HTTP client with a fixed timeout.
///
/// Non-2xx statuses are returned as responses, not errors.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpClient {
    /// Builds a client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> KeelResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KeelError::internal_with_source("cannot build http client", e))?;
        Ok(Self { client, timeout })
    }

    /// The per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The underlying client, for building requests.
    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Starts a `GET` request.
    pub fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.get(url)
    }

    /// Sends a request and logs its outcome.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the request cannot be built, times
    /// out, or fails at the transport level.
    pub async fn send(&self, request: reqwest::RequestBuilder) -> KeelResult<reqwest::Response> {
        let request = request
            .build()
            .map_err(|e| KeelError::internal_with_source("invalid outbound request", e))?;
        let method = request.method().clone();
        let url = request.url().clone();

        match self.client.execute(request).await {
            Ok(response) => {
                debug!(
                    http.method = %method,
                    url = %url,
                    http.status_code = response.status().as_u16(),
                    "http client call completed"
                );
                Ok(response)
            }
            Err(e) => {
                debug!(http.method = %method, url = %url, error = %e, "http client call failed");
                Err(KeelError::backend_unavailable_with_source(
                    format!("{method} {url} failed"),
                    e,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ExecutionContext;
    use serde_json::json;

    fn registry(context: ExecutionContext, settings: Settings) -> Registry {
        let registry = Registry::new(context);
        register_defaults(&registry, settings, AppHooks::default(), Vec::new());
        registry
    }

    fn redis_settings() -> Settings {
        let mut settings = Settings::default();
        settings.redis.enabled = true;
        settings
    }

    #[test]
    fn test_cache_alias_resolves_same_instance() {
        let registry = registry(ExecutionContext::WebWorker, Settings::default());
        let cache = registry.resolve::<SharedCache>(keys::CACHE).unwrap();
        let simple = registry.resolve::<SharedCache>(keys::CACHE_SIMPLE).unwrap();
        assert!(Arc::ptr_eq(&cache, &simple));
    }

    #[test]
    fn test_cli_cache_is_memory_even_with_redis() {
        let registry = registry(ExecutionContext::Cli, redis_settings());
        let cache = registry.resolve_cloned::<SharedCache>(keys::CACHE).unwrap();
        assert_eq!(cache.name(), "memory");

        let redis = registry.resolve_cloned::<SharedCache>(keys::REDIS).unwrap();
        assert_eq!(redis.name(), "redis");
    }

    #[test]
    fn test_web_cache_is_redis_when_enabled() {
        let registry = registry(ExecutionContext::WebWorker, redis_settings());
        let cache = registry.resolve_cloned::<SharedCache>(keys::CACHE).unwrap();
        assert_eq!(cache.name(), "redis");
    }

    #[test]
    fn test_rate_limiter_uses_context_cache() {
        let registry = registry(ExecutionContext::Cli, redis_settings());
        let limiter = registry.resolve::<RateLimiter>(keys::RATE_LIMITER).unwrap();
        assert_eq!(limiter.backend(), "memory");
    }

    #[test]
    fn test_http_client_timeout_from_settings() {
        let registry = registry(ExecutionContext::WebWorker, Settings::default());
        let client = registry.resolve::<HttpClient>(keys::HTTP_CLIENT).unwrap();
        assert_eq!(client.timeout(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_http_client_transport_failure() {
        let client = HttpClient::new(Duration::from_millis(500)).unwrap();
        let err = client
            .send(client.get("http://127.0.0.1:1/"))
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::BackendUnavailable { .. }));
    }

    #[test]
    fn test_view_is_seeded() {
        let registry = registry(ExecutionContext::WebWorker, Settings::default());
        let view = registry.resolve::<ViewContext>(keys::VIEW).unwrap();

        assert_eq!(view.get("settings").unwrap()["app_name"], json!("keel"));
        assert!(view.get("router").is_none());
        assert_eq!(
            view.call_function("escape_js", &[json!("</script>\"")]).unwrap(),
            json!("\"</script>\\\"\"")
        );
    }

    #[test]
    fn test_view_service_function_reads_the_registry() {
        let registry = registry(ExecutionContext::WebWorker, Settings::default());
        registry.instance("app.meta", json!({ "version": "1.4.0" }));
        registry.singleton("app.motd", |_| Ok::<_, KeelError>("hello".to_string()));
        registry.alias("app.about", "app.meta");

        let view = registry.resolve::<ViewContext>(keys::VIEW).unwrap();
        assert_eq!(
            view.call_function("service", &[json!("app.meta")]).unwrap()["version"],
            json!("1.4.0")
        );
        assert_eq!(
            view.call_function("service", &[json!("app.about")]).unwrap(),
            json!({ "version": "1.4.0" })
        );
        assert_eq!(
            view.call_function("service", &[json!("app.motd")]).unwrap(),
            json!("hello")
        );

        let err = view
            .call_function("service", &[json!(keys::HTTP_CLIENT)])
            .unwrap_err();
        assert!(matches!(
            err,
            KeelError::ServiceTypeMismatch { ref key, .. } if key == keys::HTTP_CLIENT
        ));

        let err = view.call_function("service", &[json!("missing")]).unwrap_err();
        assert!(matches!(err, KeelError::UnknownService { .. }));

        let err = view.call_function("service", &[]).unwrap_err();
        assert!(matches!(err, KeelError::BadRequest { .. }));
    }

    #[test]
    fn test_view_is_transient() {
        let registry = registry(ExecutionContext::WebWorker, Settings::default());
        let a = registry.resolve::<ViewContext>(keys::VIEW).unwrap();
        let b = registry.resolve::<ViewContext>(keys::VIEW).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
