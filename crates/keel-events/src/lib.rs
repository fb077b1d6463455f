//! # Keel Events
//!
//! One-time, collaborative build phases. Core code and plugins subscribe
//! handlers to a phase; when the phase is dispatched, each handler gets a
//! mutable reference to the shared payload, highest priority first.
//!
//! | Phase | Name | Payload |
//! |-------|------|---------|
//! | [`BuildConsoleCommands`] | `build-console-commands` | [`CommandSet`] |
//! | [`BuildRoutes`] | `build-routes` | [`keel_middleware::RouteBuilder`] |
//! | [`BuildView`] | `build-view` | [`ViewContext`] |

#![doc(html_root_url = "https://docs.rs/keel-events/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod bus;
pub mod console;
mod phases;
pub mod view;

pub use bus::{EventBus, Subscriber, DEFAULT_PRIORITY};
pub use console::{Command, CommandSet};
pub use phases::{BuildConsoleCommands, BuildRoutes, BuildView, Phase};
pub use view::{ViewContext, ViewFunction};
