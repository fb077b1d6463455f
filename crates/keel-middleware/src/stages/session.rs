//! Session frame.
//!
//! Attaches the request's [`Session`] to the context before the inner chain
//! runs and persists it afterwards. A `Set-Cookie` header is appended only
//! when the session was mutated.

use http::header::{HeaderValue, SET_COOKIE};
use keel_core::KeelError;
use tracing::debug;

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::session::{Session, SessionStore};
use crate::types::{MiddlewareResult, Request};

/// Loads and saves the session around the inner chain.
#[derive(Debug, Clone)]
pub struct SessionMiddleware {
    store: SessionStore,
}

impl SessionMiddleware {
    /// Creates the frame over `store`.
    #[must_use]
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }
}

impl Middleware for SessionMiddleware {
    fn name(&self) -> &'static str {
        "session"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            let session = self.store.load_from_headers(request.headers()).await?;
            ctx.set_extension(session.clone());

            // Errors pass through untouched; a failed request persists nothing.
            let mut response = next.run(ctx, request).await?;

            if let Some(id) = self.store.save(&session).await? {
                debug!(request_id = %ctx.request_id(), "session saved");
                let cookie = HeaderValue::from_str(&self.store.set_cookie_header(&id))
                    .map_err(|e| KeelError::internal_with_source("invalid session cookie", e))?;
                response.headers_mut().append(SET_COOKIE, cookie);
            }
            Ok(response)
        })
    }
}

/// Reads the session attached by [`SessionMiddleware`].
#[must_use]
pub fn session(ctx: &MiddlewareContext) -> Option<&Session> {
    ctx.get_extension::<Session>()
}
