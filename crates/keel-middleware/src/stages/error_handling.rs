//! Error-handling frame.
//!
//! The outermost frame. Everything inside it, the handler included, runs
//! under `catch_unwind`, so an `Err` or a panic from any inner frame comes
//! back here and is rendered as a JSON error envelope:
//!
//! ```json
//! {
//!   "error": {
//!     "code": "INTERNAL_ERROR",
//!     "message": "An internal error occurred",
//!     "category": "internal"
//!   },
//!   "request_id": "0190a6c2-..."
//! }
//! ```
//!
//! Outside production the envelope also carries `details.origin`, the error's
//! source chain.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use http::header::{HeaderValue, ALLOW, RETRY_AFTER};
use keel_core::KeelError;
use tracing::{error, info};

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::types::{MiddlewareResult, Request, Response, ResponseExt};

/// Converts failures from inner frames into error responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorHandlingMiddleware {
    verbose: bool,
}

impl ErrorHandlingMiddleware {
    /// `verbose` adds diagnostic detail to responses; use it outside production.
    #[must_use]
    pub const fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Whether responses carry diagnostic detail.
    #[must_use]
    pub const fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Renders `err` for the request in `ctx`, logging it on the way.
    pub fn render(&self, ctx: &MiddlewareContext, err: &KeelError) -> Response {
        let request_id = ctx.request_id().to_string();

        if err.is_expected() {
            info!(request_id = %request_id, error.code = err.error_code(), error = %err, "request rejected");
        } else {
            error!(
                request_id = %request_id,
                error.code = err.error_code(),
                error = %err,
                origin = ?err.origin_chain(),
                "unhandled failure"
            );
            keel_telemetry::metrics::record_unhandled_error(err.error_code());
        }

        let envelope = err.to_envelope(Some(&request_id), self.verbose);
        let mut response = Response::from_error(err, &envelope);
        add_error_headers(&mut response, err);
        response
    }
}

/// Adds the headers an error status calls for.
pub(crate) fn add_error_headers(response: &mut Response, err: &KeelError) {
    match err {
        KeelError::RateLimitExceeded {
            retry_after_secs: Some(seconds),
        } => {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(*seconds));
        }
        KeelError::MethodNotAllowed { allowed, .. } => {
            if let Ok(value) = HeaderValue::from_str(&allowed.join(", ")) {
                response.headers_mut().insert(ALLOW, value);
            }
        }
        _ => {}
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Middleware for ErrorHandlingMiddleware {
    fn name(&self) -> &'static str {
        "error_handling"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            let outcome = AssertUnwindSafe(next.run(ctx, request)).catch_unwind().await;
            let err = match outcome {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(err)) => err,
                Err(payload) => KeelError::internal(format!(
                    "handler panicked: {}",
                    panic_message(payload.as_ref())
                )),
            };
            Ok(self.render(ctx, &err))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{body_json, request, run, FailingEndpoint, OkEndpoint, PanickingEndpoint};
    use http::StatusCode;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_passes_success_through() {
        let frames: Vec<crate::BoxedMiddleware> = vec![Arc::new(ErrorHandlingMiddleware::new(false))];
        let (response, _) = run(&frames, &OkEndpoint, request("GET", "/")).await;
        assert_eq!(response.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_internal_error_is_generic_when_not_verbose() {
        let frames: Vec<crate::BoxedMiddleware> = vec![Arc::new(ErrorHandlingMiddleware::new(false))];
        let endpoint = FailingEndpoint(|| KeelError::internal("db password is hunter2"));
        let (response, ctx) = run(&frames, &endpoint, request("GET", "/")).await;

        let response = response.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(json["error"]["message"], keel_core::GENERIC_MESSAGE);
        assert!(json["error"].get("details").is_none());
        assert_eq!(json["request_id"], ctx.request_id().to_string());
    }

    #[tokio::test]
    async fn test_verbose_includes_origin() {
        let frames: Vec<crate::BoxedMiddleware> = vec![Arc::new(ErrorHandlingMiddleware::new(true))];
        let endpoint = FailingEndpoint(|| KeelError::internal("db offline"));
        let (response, _) = run(&frames, &endpoint, request("GET", "/")).await;

        let json = body_json(response.unwrap()).await;
        assert!(json["error"]["message"].as_str().unwrap().contains("db offline"));
        assert!(json["error"]["details"]["origin"].is_array());
    }

    #[tokio::test]
    async fn test_panic_becomes_500() {
        let frames: Vec<crate::BoxedMiddleware> = vec![Arc::new(ErrorHandlingMiddleware::new(false))];
        let (response, _) = run(&frames, &PanickingEndpoint, request("GET", "/")).await;
        assert_eq!(response.unwrap().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after() {
        let frames: Vec<crate::BoxedMiddleware> = vec![Arc::new(ErrorHandlingMiddleware::new(false))];
        let endpoint = FailingEndpoint(|| KeelError::rate_limited(Some(12)));
        let (response, _) = run(&frames, &endpoint, request("GET", "/")).await;

        let response = response.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "12");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
