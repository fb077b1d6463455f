//! Core middleware trait and continuation.
//!
//! Every frame implements [`Middleware`]. A frame receives the mutable
//! per-request [`MiddlewareContext`], the request, and a [`Next`] that runs
//! the rest of the chain. Not calling `next` short-circuits: inner frames and
//! the handler are skipped, but every frame already entered still sees the
//! response on its way out.
//!
//! # Example
//!
//! ```
//! use keel_middleware::{BoxFuture, Middleware, MiddlewareContext, MiddlewareResult, Next, Request};
//!
//! struct Timing;
//!
//! impl Middleware for Timing {
//!     fn name(&self) -> &'static str {
//!         "timing"
//!     }
//!
//!     fn process<'a>(
//!         &'a self,
//!         ctx: &'a mut MiddlewareContext,
//!         request: Request,
//!         next: Next<'a>,
//!     ) -> BoxFuture<'a, MiddlewareResult> {
//!         Box::pin(async move {
//!             let response = next.run(ctx, request).await;
//!             tracing::debug!(elapsed_ms = ctx.elapsed().as_millis() as u64, "timed");
//!             response
//!         })
//!     }
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::MiddlewareContext;
use crate::types::{MiddlewareResult, Request};

/// A boxed future that returns `T`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A type-erased middleware that can be stored in the chain.
pub type BoxedMiddleware = Arc<dyn Middleware>;

/// A link in the request-processing chain.
///
/// # Invariants
///
/// - A frame calls `next.run()` at most once
/// - A frame never changes the order of the frames around it
pub trait Middleware: Send + Sync + 'static {
    /// Name used in logs and in [`crate::Pipeline::stage_names`].
    fn name(&self) -> &'static str;

    /// Processes the request, usually by delegating to `next`.
    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult>;
}

/// The innermost step of a chain, reached once every frame has delegated.
pub trait Endpoint: Send + Sync {
    /// Produces the response for a request that passed every frame.
    fn call<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
    ) -> BoxFuture<'a, MiddlewareResult>;
}

/// The rest of the chain after the current frame.
///
/// `Next` borrows the frames of an already-assembled pipeline; running it
/// allocates nothing beyond the boxed futures of the frames themselves.
pub struct Next<'a> {
    remaining: &'a [BoxedMiddleware],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    /// A continuation over `frames`, ending at `endpoint`.
    pub fn new(frames: &'a [BoxedMiddleware], endpoint: &'a dyn Endpoint) -> Self {
        Self {
            remaining: frames,
            endpoint,
        }
    }

    /// Number of frames still ahead.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }

    /// Runs the next frame, or the endpoint when no frames are left.
    ///
    /// Consumes `self`, so the rest of the chain runs at most once.
    pub async fn run(self, ctx: &mut MiddlewareContext, request: Request) -> MiddlewareResult {
        match self.remaining.split_first() {
            Some((frame, rest)) => {
                let next = Next {
                    remaining: rest,
                    endpoint: self.endpoint,
                };
                frame.process(ctx, request, next).await
            }
            None => self.endpoint.call(ctx, request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Response, ResponseExt};
    use bytes::Bytes;
    use http::StatusCode;
    use http_body_util::Full;

    #[derive(Debug, Clone, Default)]
    struct Visited(Vec<&'static str>);

    struct Recording {
        name: &'static str,
        short_circuit: bool,
    }

    impl Middleware for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn process<'a>(
            &'a self,
            ctx: &'a mut MiddlewareContext,
            request: Request,
            next: Next<'a>,
        ) -> BoxFuture<'a, MiddlewareResult> {
            Box::pin(async move {
                let mut visited = ctx.remove_extension::<Visited>().unwrap_or_default();
                visited.0.push(self.name);
                ctx.set_extension(visited);
                if self.short_circuit {
                    return Ok(Response::text(StatusCode::ACCEPTED, self.name));
                }
                next.run(ctx, request).await
            })
        }
    }

    struct Ok200;

    impl Endpoint for Ok200 {
        fn call<'a>(
            &'a self,
            ctx: &'a mut MiddlewareContext,
            _request: Request,
        ) -> BoxFuture<'a, MiddlewareResult> {
            Box::pin(async move {
                ctx.set_extension("endpoint");
                Ok(Response::text(StatusCode::OK, "done"))
            })
        }
    }

    fn request() -> Request {
        http::Request::builder()
            .uri("/test")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn frame(name: &'static str, short_circuit: bool) -> BoxedMiddleware {
        Arc::new(Recording {
            name,
            short_circuit,
        })
    }

    #[tokio::test]
    async fn test_frames_run_in_order_then_endpoint() {
        let frames = vec![frame("a", false), frame("b", false)];
        let mut ctx = MiddlewareContext::new(None);

        let response = Next::new(&frames, &Ok200)
            .run(&mut ctx, request())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(ctx.get_extension::<Visited>().unwrap().0, vec!["a", "b"]);
        assert!(ctx.has_extension::<&'static str>());
    }

    #[tokio::test]
    async fn test_short_circuit_skips_inner_frames() {
        let frames = vec![frame("a", false), frame("stop", true), frame("c", false)];
        let mut ctx = MiddlewareContext::new(None);

        let response = Next::new(&frames, &Ok200)
            .run(&mut ctx, request())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(ctx.get_extension::<Visited>().unwrap().0, vec!["a", "stop"]);
        assert!(!ctx.has_extension::<&'static str>());
    }

    #[test]
    fn test_remaining() {
        let frames = vec![frame("a", false), frame("b", false)];
        assert_eq!(Next::new(&frames, &Ok200).remaining(), 2);
        assert_eq!(Next::new(&[], &Ok200).remaining(), 0);
    }
}
