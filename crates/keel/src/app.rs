//! Application assembly and boot.
//!
//! An [`App`] owns the service registry. Web processes call
//! [`App::pipeline`] (or [`App::serve`]), which dispatches `build-routes`
//! exactly once and freezes the result; console processes call
//! [`App::run_command`], which dispatches `build-console-commands` through
//! the console service.
//!
//! ```rust
//! use keel::prelude::*;
//!
//! async fn home(_ctx: RequestContext, _req: Request) -> KeelResult<Response> {
//!     Ok(Response::text(StatusCode::OK, "home"))
//! }
//!
//! let app = App::builder(Settings::default())
//!     .routes(|routes, _registry| {
//!         routes.get("/", home).named("home");
//!         Ok(())
//!     })
//!     .build()
//!     .unwrap();
//!
//! let pipeline = app.pipeline().unwrap();
//! assert_eq!(pipeline.routes().url_for("home", &[]).unwrap(), "/");
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use keel_config::Settings;
use keel_core::{ExecutionContext, KeelError, KeelResult, Registry};
use keel_events::{BuildRoutes, CommandSet, EventBus, Phase, Subscriber, ViewContext};
use keel_middleware::{Pipeline, RouteBuilder};
use keel_telemetry::LogConfig;
use parking_lot::Mutex;
use tracing::info;

use crate::defaults::AppHooks;
use crate::server::{Server, ServerError};
use crate::services::{keys, register_defaults};
use crate::shutdown::ShutdownSignal;

type ServiceOverride = Box<dyn FnOnce(&Registry) + Send>;

/// Collects everything an [`App`] is assembled from.
pub struct AppBuilder {
    settings: Settings,
    context: ExecutionContext,
    hooks: AppHooks,
    plugins: Vec<Arc<dyn Subscriber>>,
    overrides: Vec<ServiceOverride>,
}

impl AppBuilder {
    fn new(settings: Settings) -> Self {
        Self {
            settings,
            context: ExecutionContext::WebWorker,
            hooks: AppHooks::default(),
            plugins: Vec::new(),
            overrides: Vec::new(),
        }
    }

    /// The kind of process being started. Defaults to a web worker.
    pub fn context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    /// Installs application routes before the standard middleware.
    pub fn routes<F>(mut self, install: F) -> Self
    where
        F: Fn(&mut RouteBuilder, &Registry) -> KeelResult<()> + Send + Sync + 'static,
    {
        self.hooks.routes = Some(Arc::new(install));
        self
    }

    /// Installs application console commands.
    pub fn commands<F>(mut self, install: F) -> Self
    where
        F: Fn(&mut CommandSet, &Registry) -> KeelResult<()> + Send + Sync + 'static,
    {
        self.hooks.commands = Some(Arc::new(install));
        self
    }

    /// Adds a plugin. Plugins subscribe after the core, in the order added.
    pub fn subscriber<S: Subscriber>(mut self, subscriber: S) -> Self {
        self.plugins.push(Arc::new(subscriber));
        self
    }

    /// Registers or overrides services after the defaults.
    pub fn services<F>(mut self, register: F) -> Self
    where
        F: FnOnce(&Registry) + Send + 'static,
    {
        self.overrides.push(Box::new(register));
        self
    }

    /// Validates the settings and registers every descriptor.
    ///
    /// No service is constructed here.
    pub fn build(self) -> KeelResult<App> {
        self.settings
            .validate()
            .map_err(|e| KeelError::internal_with_source("invalid settings", e))?;

        let registry = Registry::new(self.context);
        register_defaults(&registry, self.settings, self.hooks, self.plugins);
        for register in self.overrides {
            register(&registry);
        }

        info!(
            context = %registry.context(),
            services = registry.len(),
            "application assembled"
        );
        Ok(App {
            registry,
            pipeline: Mutex::new(None),
        })
    }
}

impl fmt::Debug for AppBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppBuilder")
            .field("context", &self.context)
            .field("hooks", &self.hooks)
            .field("plugins", &self.plugins.len())
            .finish_non_exhaustive()
    }
}

/// A booted application.
pub struct App {
    registry: Registry,
    pipeline: Mutex<Option<Arc<Pipeline>>>,
}

impl App {
    /// Starts assembling an application.
    #[must_use]
    pub fn builder(settings: Settings) -> AppBuilder {
        AppBuilder::new(settings)
    }

    /// The service registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The kind of process this application runs in.
    #[must_use]
    pub fn context(&self) -> ExecutionContext {
        self.registry.context()
    }

    /// The loaded settings.
    pub fn settings(&self) -> KeelResult<Arc<Settings>> {
        self.registry.resolve(keys::SETTINGS)
    }

    /// Installs the log subscriber configured by the settings.
    pub fn init_telemetry(&self) -> KeelResult<()> {
        let settings = self.settings()?;
        keel_telemetry::init_telemetry(&LogConfig::from_settings(&settings))
            .map_err(|e| KeelError::internal_with_source("cannot initialize telemetry", e))
    }

    /// The request pipeline, built on first call.
    ///
    /// Dispatches `build-routes` once. If that dispatch failed, later calls
    /// fail too rather than dispatching again.
    pub fn pipeline(&self) -> KeelResult<Arc<Pipeline>> {
        let mut slot = self.pipeline.lock();
        if let Some(pipeline) = slot.as_ref() {
            return Ok(Arc::clone(pipeline));
        }

        let bus = self.registry.resolve::<EventBus>(keys::EVENTS)?;
        if bus.has_dispatched(BuildRoutes::NAME) {
            return Err(KeelError::internal(
                "routes were already built and the pipeline could not be assembled",
            ));
        }

        let mut routes = RouteBuilder::new();
        bus.dispatch::<BuildRoutes>(&mut routes)?;
        let pipeline = Arc::new(routes.build()?);

        self.registry
            .instance(keys::ROUTES, Arc::clone(pipeline.routes()));
        info!(
            stages = ?pipeline.stage_names(),
            routes = pipeline.routes().len(),
            "request pipeline assembled"
        );
        *slot = Some(Arc::clone(&pipeline));
        Ok(pipeline)
    }

    /// The console commands, built on first call.
    pub fn console(&self) -> KeelResult<Arc<CommandSet>> {
        self.registry.resolve(keys::CONSOLE)
    }

    /// Runs one console command.
    pub async fn run_command(&self, name: &str, args: Vec<String>) -> KeelResult<()> {
        self.console()?.run(name, args).await
    }

    /// A freshly built view context.
    pub fn view(&self) -> KeelResult<Arc<ViewContext>> {
        self.registry.resolve(keys::VIEW)
    }

    /// Serves HTTP on the configured address until SIGTERM or Ctrl-C.
    pub async fn serve(&self) -> Result<(), ServerError> {
        self.serve_with_shutdown(ShutdownSignal::with_os_signals())
            .await
    }

    /// Serves HTTP on the configured address until `shutdown` fires.
    pub async fn serve_with_shutdown(&self, shutdown: ShutdownSignal) -> Result<(), ServerError> {
        if self.context().is_cli() {
            return Err(KeelError::internal("a console application cannot serve HTTP").into());
        }
        let settings = self.settings()?;
        let addr: SocketAddr = settings
            .server
            .http_addr
            .parse()
            .map_err(|_| ServerError::InvalidAddress(settings.server.http_addr.clone()))?;

        Server::new(self.pipeline()?, addr)
            .with_max_body_bytes(settings.server.max_body_bytes)
            .run_with_shutdown(shutdown)
            .await
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("registry", &self.registry)
            .field("pipeline_built", &self.pipeline.lock().is_some())
            .finish()
    }
}
