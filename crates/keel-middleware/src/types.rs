//! Common types used throughout the middleware pipeline.

use bytes::Bytes;
use http::{header, HeaderValue, StatusCode};
use http_body_util::Full;
use keel_core::{ErrorEnvelope, KeelError};
use serde::Serialize;

/// The HTTP request type used in the middleware pipeline.
///
/// This is a standard `http::Request` with a fully buffered body.
pub type Request = http::Request<Full<Bytes>>;

/// The HTTP response type used in the middleware pipeline.
pub type Response = http::Response<Full<Bytes>>;

/// What every frame and handler returns.
///
/// `Err` travels outward until the error-handling frame renders it.
pub type MiddlewareResult = Result<Response, KeelError>;

/// Response constructors.
pub trait ResponseExt {
    /// A plain-text response.
    fn text(status: StatusCode, body: impl Into<String>) -> Response;

    /// A JSON response. Serialization failures become an `Internal` error.
    fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Response, KeelError>;

    /// A redirect to `location`.
    fn redirect(status: StatusCode, location: &str) -> Result<Response, KeelError>;

    /// Renders an error envelope with the error's own status code.
    fn from_error(error: &KeelError, envelope: &ErrorEnvelope) -> Response;
}

impl ResponseExt for Response {
    fn text(status: StatusCode, body: impl Into<String>) -> Response {
        let mut response = http::Response::new(Full::new(Bytes::from(body.into())));
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }

    fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Response, KeelError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| KeelError::internal_with_source("failed to serialize response", e))?;
        Ok(json_response(status, body))
    }

    fn redirect(status: StatusCode, location: &str) -> Result<Response, KeelError> {
        let location = HeaderValue::from_str(location)
            .map_err(|e| KeelError::internal_with_source("invalid redirect location", e))?;
        let mut response = http::Response::new(Full::new(Bytes::new()));
        *response.status_mut() = status;
        response.headers_mut().insert(header::LOCATION, location);
        Ok(response)
    }

    fn from_error(error: &KeelError, envelope: &ErrorEnvelope) -> Response {
        // Envelopes hold only strings and JSON values, so this cannot fail.
        let body = serde_json::to_vec(envelope).unwrap_or_default();
        json_response(error.status_code(), body)
    }
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response {
    let mut response = http::Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
