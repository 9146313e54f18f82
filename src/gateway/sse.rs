//! HTTP Gateway
//!
//! Serves the Server-Sent Events stream, `/health` and `/metrics` on one
//! hyper server. Each SSE response body owns its channel receiver; when
//! hyper drops the body (client gone, write failed) the connection is
//! closed on the handler.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Interval};
use tracing::{debug, error, info, warn};

use super::{new_identity, GatewayError};
use crate::bridge::ConnectionHandler;
use crate::broadcast::{Framing, MpscChannel};
use crate::metrics::Metrics;

type Body = UnsyncBoxBody<Bytes, Infallible>;

const KEEP_ALIVE_FRAME: &[u8] = b": keep-alive\n\n";

struct Shared {
    handler: Arc<dyn ConnectionHandler>,
    metrics: Option<Arc<Metrics>>,
    sse_path: String,
    keep_alive: Duration,
}

/// HTTP server for the event stream and operational endpoints
pub struct HttpGateway {
    handler: Arc<dyn ConnectionHandler>,
    metrics: Option<Arc<Metrics>>,
    sse_path: String,
    keep_alive: Duration,
}

impl HttpGateway {
    pub fn new(handler: Arc<dyn ConnectionHandler>, sse_path: impl Into<String>) -> Self {
        Self {
            handler,
            metrics: None,
            sse_path: sse_path.into(),
            keep_alive: Duration::from_secs(15),
        }
    }

    /// Serve `/metrics` from `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Interval between keep-alive comments on idle event streams
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), GatewayError> {
        info!(
            "HTTP gateway listening on http://{}{}",
            listener.local_addr()?,
            self.sse_path
        );

        let shared = Arc::new(Shared {
            handler: self.handler,
            metrics: self.metrics,
            sse_path: self.sse_path,
            keep_alive: self.keep_alive,
        });

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("HTTP gateway: Accept failed: {}", e);
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let shared = shared.clone();

                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let shared = shared.clone();
                            async move { handle_request(req, shared).await }
                        });

                        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                            debug!("Error serving HTTP connection from {}: {:?}", addr, err);
                        }
                    });
                }
                _ = shutdown.recv() => {
                    info!("HTTP gateway: Shutting down");
                    return Ok(());
                }
            }
        }
    }
}

fn full(status: StatusCode, body: impl Into<Bytes>) -> Response<Body> {
    let mut response = Response::new(Full::new(body.into()).boxed_unsync());
    *response.status_mut() = status;
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    shared: Arc<Shared>,
) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path();

    let response = if path == shared.sse_path {
        if req.method() == Method::GET {
            open_event_stream(&shared)
        } else {
            full(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
        }
    } else {
        match path {
            "/health" | "/healthz" => full(StatusCode::OK, "OK"),
            "/metrics" => match shared.metrics {
                Some(ref metrics) => render_metrics(metrics),
                None => full(StatusCode::NOT_FOUND, "Not Found"),
            },
            _ => full(StatusCode::NOT_FOUND, "Not Found"),
        }
    };

    Ok(response)
}

fn render_metrics(metrics: &Metrics) -> Response<Body> {
    match metrics.encode() {
        Ok((buffer, content_type)) => {
            let mut response = full(StatusCode::OK, buffer);
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            full(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
        }
    }
}

/// Calls `on_close` when the response body is dropped
struct CloseOnDrop {
    handler: Arc<dyn ConnectionHandler>,
    identity: String,
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        debug!("Event stream '{}' closed", self.identity);
        self.handler.on_close(&self.identity);
    }
}

struct StreamState {
    frames: mpsc::UnboundedReceiver<String>,
    ticker: Interval,
    _close: CloseOnDrop,
}

fn open_event_stream(shared: &Shared) -> Response<Body> {
    let identity = new_identity();
    let (channel, frames) = MpscChannel::new(identity.clone(), Framing::EventStream);
    if !shared.handler.on_open(&identity, channel) {
        return full(StatusCode::INTERNAL_SERVER_ERROR, "Could not open stream");
    }
    debug!("Event stream opened as '{}'", identity);

    let state = StreamState {
        frames,
        ticker: interval(shared.keep_alive),
        _close: CloseOnDrop {
            handler: shared.handler.clone(),
            identity,
        },
    };

    // The first tick fires immediately, flushing the headers to the client
    let body = stream::unfold(state, |mut state| async move {
        let chunk = tokio::select! {
            frame = state.frames.recv() => match frame {
                Some(frame) => Bytes::from(frame),
                None => return None,
            },
            _ = state.ticker.tick() => Bytes::from_static(KEEP_ALIVE_FRAME),
        };
        Some((Ok::<_, Infallible>(Frame::data(chunk)), state))
    });

    let mut response = Response::new(StreamBody::new(body).boxed_unsync());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}
