//! Shared helpers for unit tests.

use std::net::SocketAddr;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use keel_core::KeelError;

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, BoxedMiddleware, Endpoint, Next};
use crate::types::{MiddlewareResult, Request, Response, ResponseExt};

pub(crate) fn request(method: &str, uri: &str) -> Request {
    http::Request::builder()
        .method(method)
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

pub(crate) async fn run(
    frames: &[BoxedMiddleware],
    endpoint: &dyn Endpoint,
    request: Request,
) -> (MiddlewareResult, MiddlewareContext) {
    run_from(frames, endpoint, request, None).await
}

pub(crate) async fn run_from(
    frames: &[BoxedMiddleware],
    endpoint: &dyn Endpoint,
    request: Request,
    client_addr: Option<SocketAddr>,
) -> (MiddlewareResult, MiddlewareContext) {
    let mut ctx = MiddlewareContext::new(client_addr);
    let result = Next::new(frames, endpoint).run(&mut ctx, request).await;
    (result, ctx)
}

pub(crate) async fn body_json(response: Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

/// Answers 200 and records the URI it saw.
pub(crate) struct OkEndpoint;

#[derive(Debug, Clone)]
pub(crate) struct SeenUri(pub http::Uri);

impl Endpoint for OkEndpoint {
    fn call<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            ctx.set_extension(SeenUri(request.uri().clone()));
            Ok(Response::text(StatusCode::OK, "ok"))
        })
    }
}

pub(crate) struct FailingEndpoint(pub fn() -> KeelError);

impl Endpoint for FailingEndpoint {
    fn call<'a>(
        &'a self,
        _ctx: &'a mut MiddlewareContext,
        _request: Request,
    ) -> BoxFuture<'a, MiddlewareResult> {
        let err = (self.0)();
        Box::pin(async move { Err(err) })
    }
}

pub(crate) struct PanickingEndpoint;

impl Endpoint for PanickingEndpoint {
    fn call<'a>(
        &'a self,
        _ctx: &'a mut MiddlewareContext,
        _request: Request,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move { explode() })
    }
}

fn explode() -> MiddlewareResult {
    panic!("handler exploded")
}
