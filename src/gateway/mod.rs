//! Downstream Gateways
//!
//! Accept browser and internal connections and hand them to a
//! [`ConnectionHandler`](crate::bridge::ConnectionHandler):
//! - [`WebSocketGateway`]: one text frame per event (raw JSON)
//! - [`HttpGateway`]: Server-Sent Events stream, plus `/health` and `/metrics`
//!
//! Every accepted connection gets a fresh UUID identity, `on_open` once it is
//! established and `on_close` once it goes away.

mod sse;
mod websocket;

#[cfg(test)]
mod tests;

pub use sse::HttpGateway;
pub use websocket::WebSocketGateway;

use std::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;

/// Error type for gateway operations
#[derive(Debug)]
pub enum GatewayError {
    /// Socket error (bind, accept)
    Io(io::Error),
    /// WebSocket handshake or protocol error
    WebSocket(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Io(e) => write!(f, "IO error: {}", e),
            GatewayError::WebSocket(msg) => write!(f, "WebSocket error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<io::Error> for GatewayError {
    fn from(e: io::Error) -> Self {
        GatewayError::Io(e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::WebSocket(e.to_string())
    }
}

/// Bind a listener for a gateway
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, GatewayError> {
    Ok(TcpListener::bind(addr).await?)
}

/// Fresh identity for an accepted connection
fn new_identity() -> String {
    uuid::Uuid::new_v4().to_string()
}
