//! WebSocket Gateway
//!
//! Upgrades connections on a single path and forwards every bridged event as
//! a text frame. Inbound frames other than Close are ignored.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use super::{new_identity, GatewayError};
use crate::bridge::ConnectionHandler;
use crate::broadcast::{Framing, MpscChannel};

/// Accepts WebSocket connections and bridges them with raw framing
pub struct WebSocketGateway {
    handler: Arc<dyn ConnectionHandler>,
    path: String,
}

impl WebSocketGateway {
    pub fn new(handler: Arc<dyn ConnectionHandler>, path: impl Into<String>) -> Self {
        Self {
            handler,
            path: path.into(),
        }
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), GatewayError> {
        info!(
            "WebSocket gateway listening on ws://{}{}",
            listener.local_addr()?,
            self.path
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("WebSocket gateway: Accept failed: {}", e);
                            continue;
                        }
                    };
                    debug!("New WebSocket connection from {}", addr);
                    let handler = self.handler.clone();
                    let path = self.path.clone();
                    let shutdown = shutdown.resubscribe();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, handler, path, shutdown).await {
                            debug!("WebSocket connection error from {}: {}", addr, e);
                        }
                    });
                }
                _ = shutdown.recv() => {
                    info!("WebSocket gateway: Shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handler: Arc<dyn ConnectionHandler>,
    expected_path: String,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), GatewayError> {
    let ws = tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, response: Response| {
        let request_path = req.uri().path();
        if request_path != expected_path {
            let mut error = ErrorResponse::new(Some(format!(
                "Invalid path: expected '{}', got '{}'",
                expected_path, request_path
            )));
            *error.status_mut() = StatusCode::NOT_FOUND;
            return Err(error);
        }
        Ok(response)
    })
    .await?;

    let identity = new_identity();
    let (channel, mut frames) = MpscChannel::new(identity.clone(), Framing::Raw);
    if !handler.on_open(&identity, channel) {
        return Ok(());
    }
    debug!("WebSocket connection {} opened as '{}'", addr, identity);

    let (mut sink, mut incoming) = ws.split();
    let result = loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(text) = frame else {
                    break Ok(());
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    break Err(GatewayError::from(e));
                }
            }
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(GatewayError::from(e)),
            },
            _ = shutdown.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break Ok(());
            }
        }
    };

    handler.on_close(&identity);
    debug!("WebSocket connection '{}' closed", identity);
    result
}
