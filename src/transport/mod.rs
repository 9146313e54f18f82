//! Broker Transport
//!
//! The seam between the bridge and the MQTT wire protocol. A [`Transport`]
//! issues subscribe/unsubscribe requests and resolves them once the broker
//! acknowledges; everything else it observes (connects, disconnects, inbound
//! publishes) is pushed as a [`TransportEvent`] onto a channel owned by the
//! [`BrokerConnection`](crate::connection::BrokerConnection).

mod mqtt;

#[cfg(test)]
pub(crate) mod mock;

pub use mqtt::MqttTransport;

use std::fmt;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Sender half used by transports to publish their events
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiver half consumed by the connection's event pump
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the event channel shared by a transport and its connection
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Error type for transport operations
#[derive(Debug)]
pub enum TransportError {
    /// TCP connection refused (broker not running or restarting)
    ConnectionRefused,
    /// Connection attempt or request timed out
    Timeout,
    /// Connection was lost while the request was outstanding
    ConnectionLost(String),
    /// Broker rejected the request (e.g. SUBACK failure code)
    Rejected(String),
    /// Request queue to the client library is closed or full
    RequestFailed(String),
    /// Other I/O or protocol error
    Other(String),
}

impl TransportError {
    /// Whether this error is an expected connectivity failure.
    ///
    /// Refusals and timeouts happen whenever the broker restarts; they are
    /// logged quietly and only drive the reconnect loop.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionRefused | TransportError::Timeout
        )
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectionRefused => write!(f, "Connection refused"),
            TransportError::Timeout => write!(f, "Operation timed out"),
            TransportError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            TransportError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            TransportError::RequestFailed(msg) => write!(f, "Request failed: {}", msg),
            TransportError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused,
            io::ErrorKind::TimedOut => TransportError::Timeout,
            _ => TransportError::Other(e.to_string()),
        }
    }
}

/// Per-message metadata handed to every handler alongside the payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageMeta {
    /// QoS level the message was delivered with (0, 1 or 2)
    pub qos: u8,
    /// Retained flag
    pub retain: bool,
    /// Duplicate delivery flag
    pub dup: bool,
    /// Packet identifier (0 for QoS 0)
    pub packet_id: u16,
}

/// A message received from the broker
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub meta: MessageMeta,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            meta: MessageMeta::default(),
        }
    }
}

/// Events emitted by a transport
#[derive(Debug)]
pub enum TransportEvent {
    /// Broker accepted the connection (CONNACK success)
    Connected,
    /// Connection attempt failed or an established connection dropped
    Disconnected(TransportError),
    /// Publish received on a subscribed topic
    Message(InboundMessage),
}

/// Broker transport
///
/// Implementations own the physical connection. Both request methods resolve
/// only when the broker has acknowledged (or refused) the request.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to an exact topic
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Unsubscribe from an exact topic
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Disconnect from the broker and stop reconnecting
    async fn disconnect(&self) -> Result<(), TransportError>;
}
