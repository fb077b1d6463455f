//! # Keel Core
//!
//! Foundational types shared by every keel crate:
//!
//! - [`registry::Registry`] - lazy, dependency-resolving service registry
//! - [`ExecutionContext`] - web worker vs. command-line process
//! - [`Environment`] - production / development / testing
//! - [`KeelError`] - the error taxonomy used across the runtime

#![doc(html_root_url = "https://docs.rs/keel-core/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod context;
mod error;
pub mod registry;

pub use context::{Environment, ExecutionContext};
pub use error::{ErrorCategory, ErrorDetail, ErrorEnvelope, KeelError, KeelResult, GENERIC_MESSAGE};
pub use registry::{Lifetime, Registry, RegistryHandle, Resolver, ServiceKey};
