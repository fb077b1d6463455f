//! The phases an application goes through while starting.

use keel_middleware::RouteBuilder;

use crate::console::CommandSet;
use crate::view::ViewContext;

/// A named build phase and the payload its handlers mutate.
pub trait Phase: 'static {
    /// The phase name handlers are registered under.
    const NAME: &'static str;

    /// What handlers receive.
    type Payload: 'static;
}

/// Registering console commands.
#[derive(Debug, Clone, Copy)]
pub struct BuildConsoleCommands;

impl Phase for BuildConsoleCommands {
    const NAME: &'static str = "build-console-commands";
    type Payload = CommandSet;
}

/// Registering routes and middleware.
///
/// The core subscriber installs the standard frames here, after the
/// application's own routes.
#[derive(Debug, Clone, Copy)]
pub struct BuildRoutes;

impl Phase for BuildRoutes {
    const NAME: &'static str = "build-routes";
    type Payload = RouteBuilder;
}

/// Augmenting the data and functions available to views.
#[derive(Debug, Clone, Copy)]
pub struct BuildView;

impl Phase for BuildView {
    const NAME: &'static str = "build-view";
    type Payload = ViewContext;
}
