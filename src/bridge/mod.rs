//! Connection Bridge
//!
//! Ties a downstream connection's lifetime to a consumer registration. When a
//! connection opens, its identity is subscribed to the bridged topic and every
//! decoded message is wrapped as `{"kind", "payload"}`, framed for the
//! connection's channel and sent. When it closes, the registration goes away;
//! the last close releases the broker subscription.
//!
//! The bridge also keeps every open channel in a [`Broadcaster`] so broker
//! status changes can be pushed to all connections at once.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::broadcast::{Broadcaster, Channel, Event};
use crate::connection::{BrokerConnection, LifecycleEvent, ListenerId};
use crate::consumer::{JsonDecoder, PayloadDecoder, TypedConsumer};

#[cfg(test)]
mod tests;

/// `kind` of broker status events
pub const STATUS_KIND: &str = "status";

/// Receives downstream connection open/close notifications.
///
/// Gateways hold this trait object so they do not depend on the bridged
/// payload type.
pub trait ConnectionHandler: Send + Sync {
    /// Called once when a connection is established
    fn on_open(&self, identity: &str, channel: Arc<dyn Channel>) -> bool;

    /// Called once when the connection goes away
    fn on_close(&self, identity: &str) -> bool;
}

/// Bridges downstream connections to a [`TypedConsumer`]
pub struct ConnectionBridge<T, D = JsonDecoder> {
    consumer: Arc<TypedConsumer<T, D>>,
    kind: String,
    status: Arc<Broadcaster>,
    /// identity -> channel id
    open: Mutex<HashMap<String, String>>,
}

impl<T, D> ConnectionBridge<T, D>
where
    T: Serialize + 'static,
    D: PayloadDecoder<T>,
{
    /// Bridge `consumer`, tagging forwarded events with `kind`
    pub fn new(consumer: Arc<TypedConsumer<T, D>>, kind: impl Into<String>) -> Self {
        Self {
            consumer,
            kind: kind.into(),
            status: Arc::new(Broadcaster::new()),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Use `broadcaster` for status events instead of a private one
    pub fn with_broadcaster(mut self, broadcaster: Arc<Broadcaster>) -> Self {
        self.status = broadcaster;
        self
    }

    /// Subscribe `identity` and forward every message to `channel`.
    ///
    /// Returns false if the identity is already open or another open
    /// identity uses the same channel id.
    pub fn on_open(&self, identity: &str, channel: Arc<dyn Channel>) -> bool {
        let mut open = self.open.lock();
        if open.contains_key(identity) {
            debug!("Bridge: '{}' is already open", identity);
            return false;
        }

        if !self.status.register(channel.clone()) {
            warn!(
                "Bridge: Channel '{}' for '{}' is already registered",
                channel.id(),
                identity
            );
            return false;
        }

        let kind = self.kind.clone();
        let sink = channel.clone();
        let subscribed = self.consumer.subscribe(identity, move |payload: T| {
            let event = Event::new(kind.as_str(), payload);
            match event.encode() {
                Ok(json) => {
                    if let Err(e) = sink.send(&sink.framing().frame(&json)) {
                        debug!("Bridge: Send to '{}' failed: {}", sink.id(), e);
                    }
                }
                Err(e) => error!("Bridge: Failed to encode event: {}", e),
            }
        });
        if !subscribed {
            self.status.unregister(channel.id());
            return false;
        }

        open.insert(identity.to_string(), channel.id().to_string());
        info!(
            "Bridge: Opened '{}' on '{}' ({} open)",
            identity,
            self.consumer.topic(),
            open.len()
        );
        true
    }

    /// Unsubscribe `identity`. Unknown identities are ignored.
    pub fn on_close(&self, identity: &str) -> bool {
        let mut open = self.open.lock();
        let Some(channel_id) = open.remove(identity) else {
            return false;
        };
        self.consumer.unsubscribe(identity);
        self.status.unregister(&channel_id);
        info!(
            "Bridge: Closed '{}' on '{}' ({} open)",
            identity,
            self.consumer.topic(),
            open.len()
        );
        true
    }

    /// Push `{"kind": "status", "payload": "online" | "offline"}` to every
    /// open connection whenever the broker connection changes state.
    pub fn attach_lifecycle(&self, connection: &BrokerConnection) -> (ListenerId, ListenerId) {
        let status = self.status.clone();
        let online = connection.on_lifecycle(LifecycleEvent::Online, move || {
            status.broadcast(&Event::new(STATUS_KIND, "online"));
        });

        let status = self.status.clone();
        let offline = connection.on_lifecycle(LifecycleEvent::Offline, move || {
            status.broadcast(&Event::new(STATUS_KIND, "offline"));
        });

        (online, offline)
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_open(&self, identity: &str) -> bool {
        self.open.lock().contains_key(identity)
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.status
    }

    pub fn consumer(&self) -> &Arc<TypedConsumer<T, D>> {
        &self.consumer
    }
}

impl<T, D> ConnectionHandler for ConnectionBridge<T, D>
where
    T: Serialize + 'static,
    D: PayloadDecoder<T>,
{
    fn on_open(&self, identity: &str, channel: Arc<dyn Channel>) -> bool {
        ConnectionBridge::on_open(self, identity, channel)
    }

    fn on_close(&self, identity: &str) -> bool {
        ConnectionBridge::on_close(self, identity)
    }
}
