//! Broadcaster
//!
//! Pushes events to a dynamic set of live downstream channels. An event is
//! serialized once per broadcast and framed once per framing in use; every
//! channel in the snapshot is written independently.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::config::BroadcastConfig;
use crate::metrics::Metrics;


/// How a serialized event is wrapped for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framing {
    /// Server-Sent Events: `data: <json>\n\n`
    EventStream,
    /// The JSON text as-is (WebSocket text frames)
    Raw,
}

impl Framing {
    pub fn frame(&self, json: &str) -> String {
        match self {
            Framing::EventStream => format!("data: {}\n\n", json),
            Framing::Raw => json.to_string(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Framing::EventStream => "event_stream",
            Framing::Raw => "raw",
        }
    }
}

/// Error returned when a frame cannot be written to a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The receiving side has gone away
    Closed,
    /// Any other write failure
    Failed(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed => write!(f, "Channel closed"),
            SendError::Failed(msg) => write!(f, "Send failed: {}", msg),
        }
    }
}

impl std::error::Error for SendError {}

/// A live downstream connection that accepts framed text
pub trait Channel: Send + Sync {
    fn id(&self) -> &str;
    fn framing(&self) -> Framing;
    fn send(&self, frame: &str) -> Result<(), SendError>;
}

/// Wire format of every event pushed downstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    pub kind: String,
    pub payload: T,
}

impl<T: Serialize> Event<T> {
    pub fn new(kind: impl Into<String>, payload: T) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Serialize to JSON
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Channel backed by an unbounded Tokio mpsc sender.
///
/// The gateway owns the receiver and writes whatever arrives to its socket
/// or response body.
pub struct MpscChannel {
    id: String,
    framing: Framing,
    tx: mpsc::UnboundedSender<String>,
}

impl MpscChannel {
    pub fn new(
        id: impl Into<String>,
        framing: Framing,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            id: id.into(),
            framing,
            tx,
        });
        (channel, rx)
    }
}

impl Channel for MpscChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn framing(&self) -> Framing {
        self.framing
    }

    fn send(&self, frame: &str) -> Result<(), SendError> {
        self.tx
            .send(frame.to_string())
            .map_err(|_| SendError::Closed)
    }
}

/// Set of live channels receiving every broadcast
pub struct Broadcaster {
    channels: RwLock<Vec<Arc<dyn Channel>>>,
    auto_unregister: bool,
    metrics: Option<Arc<Metrics>>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(Vec::new()),
            auto_unregister: true,
            metrics: None,
        }
    }

    pub fn from_config(config: &BroadcastConfig) -> Self {
        Self {
            auto_unregister: config.auto_unregister,
            ..Self::new()
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Add a channel. Returns false if a channel with the same id is present.
    pub fn register(&self, channel: Arc<dyn Channel>) -> bool {
        let mut channels = self.channels.write();
        if channels.iter().any(|c| c.id() == channel.id()) {
            debug!("Broadcaster: Channel '{}' already registered", channel.id());
            return false;
        }
        if let Some(ref metrics) = self.metrics {
            metrics.channel_registered(channel.framing().as_str());
        }
        debug!(
            "Broadcaster: Registered channel '{}' ({:?})",
            channel.id(),
            channel.framing()
        );
        channels.push(channel);
        true
    }

    /// Remove a channel by id. Unknown ids are ignored.
    pub fn unregister(&self, id: &str) -> bool {
        let mut channels = self.channels.write();
        let Some(position) = channels.iter().position(|c| c.id() == id) else {
            return false;
        };
        let channel = channels.remove(position);
        if let Some(ref metrics) = self.metrics {
            metrics.channel_unregistered(channel.framing().as_str());
        }
        debug!("Broadcaster: Unregistered channel '{}'", id);
        true
    }

    pub fn has_channels(&self) -> bool {
        !self.channels.read().is_empty()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Serialize `event` once and write it to every registered channel.
    ///
    /// Returns the number of channels written successfully. With no channels
    /// registered nothing is serialized.
    pub fn broadcast<E: Serialize + ?Sized>(&self, event: &E) -> usize {
        let snapshot: Vec<Arc<dyn Channel>> = self.channels.read().clone();
        if snapshot.is_empty() {
            trace!("Broadcaster: No channels, skipping broadcast");
            return 0;
        }

        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                error!("Broadcaster: Failed to serialize event: {}", e);
                return 0;
            }
        };

        let mut event_stream: Option<String> = None;
        let mut delivered = 0;
        let mut failed = Vec::new();

        for channel in &snapshot {
            let result = match channel.framing() {
                Framing::Raw => channel.send(&json),
                Framing::EventStream => {
                    let frame = event_stream
                        .get_or_insert_with(|| Framing::EventStream.frame(&json));
                    channel.send(frame)
                }
            };
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Broadcaster: Send to '{}' failed: {}", channel.id(), e);
                    failed.push(channel.id().to_string());
                }
            }
        }

        if let Some(ref metrics) = self.metrics {
            metrics.broadcast_sent(delivered, failed.len());
        }

        if self.auto_unregister {
            for id in &failed {
                self.unregister(id);
            }
        }
        delivered
    }
}
