//! HTTP server loop.
//!
//! Accepts TCP connections, serves HTTP/1 and HTTP/2 on each through
//! `hyper-util`'s auto builder, and feeds every request through a
//! [`Pipeline`] with the peer address as connection metadata.
//!
//! Request bodies are read up to a size limit (1 MiB unless configured);
//! larger bodies get `413 Payload Too Large` without reaching the pipeline.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use keel::server::Server;
//!
//! let pipeline = app.pipeline()?;
//! Server::new(pipeline, "0.0.0.0:8080".parse()?).run().await?;
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use keel_config::DEFAULT_MAX_BODY_BYTES;
use keel_core::KeelError;
use keel_middleware::{Pipeline, Request, Response, ResponseExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::shutdown::{ConnectionTracker, ShutdownSignal};

/// Errors from running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listener could not be bound.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configured address is not a socket address.
    #[error("invalid listen address {0}")]
    InvalidAddress(String),

    /// The application could not be assembled.
    #[error(transparent)]
    App(#[from] KeelError),
}

/// Serves a pipeline over HTTP.
#[derive(Debug)]
pub struct Server {
    pipeline: Arc<Pipeline>,
    addr: SocketAddr,
    body_timeout: Duration,
    max_body_bytes: usize,
    shutdown_timeout: Duration,
}

impl Server {
    /// A server for `pipeline` listening on `addr`.
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>, addr: SocketAddr) -> Self {
        Self {
            pipeline,
            addr,
            body_timeout: Duration::from_secs(30),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// How long to wait for a request body.
    #[must_use]
    pub fn with_body_timeout(mut self, timeout: Duration) -> Self {
        self.body_timeout = timeout;
        self
    }

    /// The largest request body accepted, in bytes.
    #[must_use]
    pub fn with_max_body_bytes(mut self, max_bytes: usize) -> Self {
        self.max_body_bytes = max_bytes;
        self
    }

    /// How long to wait for open connections after shutdown starts.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Runs until SIGTERM or Ctrl-C.
    pub async fn run(self) -> Result<(), ServerError> {
        let shutdown = ShutdownSignal::with_os_signals();
        self.run_with_shutdown(shutdown).await
    }

    /// Runs until `shutdown` fires.
    pub async fn run_with_shutdown(self, shutdown: ShutdownSignal) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.addr,
                source,
            })?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Serves connections from an already-bound listener until `shutdown`
    /// fires, then drains open connections.
    pub async fn serve(self, listener: TcpListener, shutdown: ShutdownSignal) {
        match listener.local_addr() {
            Ok(addr) => info!(addr = %addr, "server listening"),
            Err(e) => warn!(error = %e, "server listening on unknown address"),
        }

        let server = Arc::new(self);
        let tracker = ConnectionTracker::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&server);
                        let token = tracker.acquire();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream, peer, shutdown).await;
                            drop(token);
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept connection"),
                },
                () = shutdown.recv() => {
                    info!("shutdown signal received, no longer accepting connections");
                    break;
                }
            }
        }

        info!(
            active = tracker.active_connections(),
            timeout_secs = server.shutdown_timeout.as_secs(),
            "draining connections"
        );
        tokio::select! {
            () = tracker.wait_for_shutdown() => info!("all connections closed"),
            () = tokio::time::sleep(server.shutdown_timeout) => warn!(
                active = tracker.active_connections(),
                "shutdown timeout reached with connections still open"
            ),
        }
        info!("server stopped");
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: ShutdownSignal,
    ) {
        let server = Arc::clone(&self);
        let service = service_fn(move |request: hyper::Request<Incoming>| {
            let server = Arc::clone(&server);
            async move { Ok::<_, Infallible>(server.handle_request(request, peer).await) }
        });

        let builder = ConnectionBuilder::new(TokioExecutor::new());
        let connection = builder.serve_connection(TokioIo::new(stream), service);
        tokio::pin!(connection);

        let result = tokio::select! {
            result = connection.as_mut() => result,
            () = shutdown.recv() => {
                debug!(peer = %peer, "closing connection for shutdown");
                connection.as_mut().graceful_shutdown();
                connection.await
            }
        };
        if let Err(e) = result {
            debug!(peer = %peer, error = %e, "connection ended with an error");
        }
    }

    async fn handle_request(&self, request: hyper::Request<Incoming>, peer: SocketAddr) -> Response {
        let (parts, body) = request.into_parts();
        let limited = Limited::new(body, self.max_body_bytes);
        let bytes = match tokio::time::timeout(self.body_timeout, limited.collect()).await {
            Ok(Ok(collected)) => collected.to_bytes(),
            Ok(Err(e)) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return reject(&KeelError::payload_too_large(self.max_body_bytes));
            }
            Ok(Err(e)) => {
                return reject(&KeelError::bad_request(format!("cannot read request body: {e}")));
            }
            Err(_) => {
                return reject(&KeelError::bad_request("timed out reading request body"));
            }
        };

        let request: Request = hyper::Request::from_parts(parts, Full::<Bytes>::new(bytes));
        self.pipeline.handle(request, Some(peer)).await
    }
}

fn reject(err: &KeelError) -> Response {
    debug!(error = %err, "request rejected before the pipeline");
    Response::from_error(err, &err.to_envelope(None, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use keel_core::KeelResult;
    use keel_middleware::{RequestContext, RouteBuilder};

    async fn hello(ctx: RequestContext, _req: Request) -> KeelResult<Response> {
        let ip = ctx.client_ip().map(|ip| ip.to_string()).unwrap_or_default();
        Ok(Response::text(StatusCode::OK, format!("hello {ip}")))
    }

    #[tokio::test]
    async fn test_serves_until_shutdown() {
        let mut routes = RouteBuilder::new();
        routes.get("/hello", hello);
        let pipeline = Arc::new(routes.build().unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = ShutdownSignal::new();

        let server = Server::new(pipeline, addr).with_shutdown_timeout(Duration::from_secs(1));
        let handle = tokio::spawn(server.serve(listener, shutdown.clone()));

        let response = reqwest::get(format!("http://{addr}/hello")).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(response.text().await.unwrap(), "hello 127.0.0.1");

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let mut routes = RouteBuilder::new();
        routes.post("/upload", |_ctx: RequestContext, _req: Request| async {
            Ok::<_, KeelError>(Response::text(StatusCode::OK, "stored"))
        });
        let pipeline = Arc::new(routes.build().unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = ShutdownSignal::new();

        let server = Server::new(pipeline, addr)
            .with_max_body_bytes(16)
            .with_shutdown_timeout(Duration::from_secs(1));
        let handle = tokio::spawn(server.serve(listener, shutdown.clone()));

        let client = reqwest::Client::new();
        let url = format!("http://{addr}/upload");

        let rejected = client.post(&url).body(vec![b'x'; 64]).send().await.unwrap();
        assert_eq!(rejected.status().as_u16(), 413);
        let body: serde_json::Value = rejected.json().await.unwrap();
        assert_eq!(body["error"]["code"], "PAYLOAD_TOO_LARGE");

        let accepted = client.post(&url).body("small").send().await.unwrap();
        assert_eq!(accepted.status().as_u16(), 200);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let pipeline = Arc::new(RouteBuilder::new().build().unwrap());

        let err = Server::new(pipeline, addr)
            .run_with_shutdown(ShutdownSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
    }
}
