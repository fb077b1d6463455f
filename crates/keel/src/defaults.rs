//! The core subscriber.
//!
//! Registered on the event bus before any plugin, at [`DEFAULT_PRIORITY`].
//! On `build-routes` it runs the application's route installer and then adds
//! every standard frame the builder does not have yet, so plugins and the
//! application may replace any of them by installing their own first.

use std::fmt;
use std::sync::Arc;

use keel_cache::{RateLimiter, SharedCache};
use keel_config::Settings;
use keel_core::{KeelError, KeelResult, Registry, RegistryHandle};
use keel_events::{
    BuildConsoleCommands, BuildRoutes, CommandSet, EventBus, Subscriber, DEFAULT_PRIORITY,
};
use keel_middleware::stages::{
    BodyParsingMiddleware, ErrorHandlingMiddleware, ForwardedProtoMiddleware,
    InjectRateLimitMiddleware, RateLimitPolicy, RemoveTrailingSlashMiddleware, SessionMiddleware,
};
use keel_middleware::{RouteBuilder, SessionStore, Stage};
use tracing::{debug, info};

use crate::services::keys;

/// Installs application routes and middleware.
pub type RouteInstaller = Arc<dyn Fn(&mut RouteBuilder, &Registry) -> KeelResult<()> + Send + Sync>;

/// Installs application console commands.
pub type CommandInstaller =
    Arc<dyn Fn(&mut CommandSet, &Registry) -> KeelResult<()> + Send + Sync>;

/// Application-supplied installers run by the core subscriber.
#[derive(Clone, Default)]
pub struct AppHooks {
    /// Runs first during `build-routes`.
    pub routes: Option<RouteInstaller>,
    /// Runs last during `build-console-commands`.
    pub commands: Option<CommandInstaller>,
}

impl fmt::Debug for AppHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppHooks")
            .field("routes", &self.routes.is_some())
            .field("commands", &self.commands.is_some())
            .finish()
    }
}

/// Registers the core contributions to each phase.
pub struct CoreSubscriber {
    registry: RegistryHandle,
    settings: Arc<Settings>,
    hooks: Arc<AppHooks>,
}

impl CoreSubscriber {
    /// A subscriber resolving services through `registry`.
    pub fn new(registry: RegistryHandle, settings: Arc<Settings>, hooks: Arc<AppHooks>) -> Self {
        Self {
            registry,
            settings,
            hooks,
        }
    }

    fn registry(&self) -> KeelResult<Registry> {
        self.registry
            .upgrade()
            .ok_or_else(|| KeelError::internal("service registry has been dropped"))
    }

    fn register_commands(&self, commands: &mut CommandSet) -> KeelResult<()> {
        if self.settings.enable_redis() {
            let registry = self.registry.clone();
            commands.command(
                "cache:clear",
                "Clear all application caches.",
                move |_args: Vec<String>| {
                    let registry = registry.clone();
                    async move {
                        let redis = registry.resolve::<SharedCache>(keys::REDIS)?;
                        redis.clear().await?;
                        info!("shared cache flushed");
                        Ok::<_, KeelError>(())
                    }
                },
            );
        }

        if let Some(install) = &self.hooks.commands {
            install(commands, &self.registry()?)?;
        }
        Ok(())
    }

    fn build_routes(&self, routes: &mut RouteBuilder) -> KeelResult<()> {
        let registry = self.registry()?;
        if let Some(install) = &self.hooks.routes {
            install(routes, &registry)?;
        }

        let settings = &self.settings;
        if !routes.has_stage(Stage::ErrorHandling) {
            routes.install(
                Stage::ErrorHandling,
                ErrorHandlingMiddleware::new(!settings.is_production()),
            )?;
        }
        if !routes.has_stage(Stage::Session) {
            let store = registry.resolve_cloned::<SessionStore>(keys::SESSION_STORE)?;
            routes.install(Stage::Session, SessionMiddleware::new(store))?;
        }
        if !routes.has_stage(Stage::RemoveTrailingSlash) {
            routes.install(Stage::RemoveTrailingSlash, RemoveTrailingSlashMiddleware::new())?;
        }
        if !routes.has_stage(Stage::ForwardedProto) {
            routes.install(
                Stage::ForwardedProto,
                ForwardedProtoMiddleware::new(settings.http.trusted_proxy_addrs()),
            )?;
        }
        if !routes.has_stage(Stage::InjectRateLimit) {
            let limiter = registry.resolve_cloned::<RateLimiter>(keys::RATE_LIMITER)?;
            routes.install(
                Stage::InjectRateLimit,
                InjectRateLimitMiddleware::new(limiter)
                    .with_policy(RateLimitPolicy::from_settings(&settings.rate_limit)),
            )?;
        }
        if !routes.has_stage(Stage::BodyParsing) {
            routes.install(
                Stage::BodyParsing,
                BodyParsingMiddleware::with_limit(settings.server.max_body_bytes),
            )?;
        }

        debug!(routes = routes.route_count(), "standard middleware installed");
        Ok(())
    }
}

impl Subscriber for CoreSubscriber {
    fn subscribe(self: Arc<Self>, bus: &EventBus) {
        let this = Arc::clone(&self);
        bus.subscribe::<BuildConsoleCommands, _>("core", DEFAULT_PRIORITY, move |commands| {
            this.register_commands(commands)
        });
        bus.subscribe::<BuildRoutes, _>("core", DEFAULT_PRIORITY, move |routes| {
            self.build_routes(routes)
        });
    }
}

impl fmt::Debug for CoreSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreSubscriber")
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}
