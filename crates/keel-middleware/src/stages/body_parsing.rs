//! Body parsing by content type.
//!
//! | Content type | Result |
//! |--------------|--------|
//! | `application/json`, `*/*+json` | [`ParsedBody::Json`] |
//! | `application/x-www-form-urlencoded` | [`ParsedBody::Form`] |
//! | anything else | [`ParsedBody::Raw`] |
//!
//! An empty body is always [`ParsedBody::Empty`]. A body that claims JSON or
//! form encoding but does not parse is rejected with `BadRequest`. The raw
//! bytes stay on the request either way.
//!
//! Bodies larger than the frame's limit are rejected with `PayloadTooLarge`
//! before any decoding.

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http_body_util::{BodyExt, Full, Limited};
use keel_config::DEFAULT_MAX_BODY_BYTES;
use keel_core::KeelError;
use serde_json::Value;

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::types::{MiddlewareResult, Request};

/// The request body, decoded according to its content type.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ParsedBody {
    /// No body.
    #[default]
    Empty,
    /// A JSON document.
    Json(Value),
    /// URL-encoded form fields in order.
    Form(Vec<(String, String)>),
    /// Any other content type.
    Raw(Bytes),
}

impl ParsedBody {
    /// A top-level field: a form value, or a JSON string, number, or bool.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<String> {
        match self {
            Self::Form(fields) => fields
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone()),
            Self::Json(value) => match value.get(name)? {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            },
            Self::Empty | Self::Raw(_) => None,
        }
    }

    /// The JSON document, if this is one.
    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Json,
    Form,
    Other,
}

fn kind(request: &Request) -> Kind {
    let Some(content_type) = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    else {
        return Kind::Other;
    };
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if essence == "application/json" || essence.ends_with("+json") {
        Kind::Json
    } else if essence == "application/x-www-form-urlencoded" {
        Kind::Form
    } else {
        Kind::Other
    }
}

/// Parses a body of the given kind.
fn parse(kind: Kind, bytes: &Bytes) -> Result<ParsedBody, KeelError> {
    if bytes.is_empty() {
        return Ok(ParsedBody::Empty);
    }
    match kind {
        Kind::Json => serde_json::from_slice(bytes)
            .map(ParsedBody::Json)
            .map_err(|e| KeelError::bad_request(format!("malformed JSON body: {e}"))),
        Kind::Form => serde_urlencoded::from_bytes(bytes)
            .map(ParsedBody::Form)
            .map_err(|e| KeelError::bad_request(format!("malformed form body: {e}"))),
        Kind::Other => Ok(ParsedBody::Raw(bytes.clone())),
    }
}

/// Decodes the body and stores a [`ParsedBody`] in the context.
#[derive(Debug, Clone, Copy)]
pub struct BodyParsingMiddleware {
    max_bytes: usize,
}

impl BodyParsingMiddleware {
    /// Creates the frame with the default 1 MiB limit.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_BODY_BYTES)
    }

    /// Creates the frame accepting bodies of at most `max_bytes`.
    #[must_use]
    pub const fn with_limit(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl Default for BodyParsingMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for BodyParsingMiddleware {
    fn name(&self) -> &'static str {
        "body_parsing"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            let kind = kind(&request);
            let (parts, body) = request.into_parts();
            let bytes = Limited::new(body, self.max_bytes)
                .collect()
                .await
                .map_err(|_| KeelError::payload_too_large(self.max_bytes))?
                .to_bytes();

            ctx.set_extension(parse(kind, &bytes)?);
            next.run(ctx, Request::from_parts(parts, Full::new(bytes))).await
        })
    }
}
