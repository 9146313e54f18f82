//! Broker Connection
//!
//! Owns the single physical connection to the broker. State moves only in
//! response to [`TransportEvent`]s; callers observe it through lifecycle
//! listeners registered with [`BrokerConnection::on_lifecycle`].
//!
//! Inbound publishes are not delivered here. The event pump owned by the
//! [`SubscriptionMultiplexer`](crate::multiplexer::SubscriptionMultiplexer)
//! feeds every event through [`BrokerConnection::handle_event`] and routes
//! whatever message comes back.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::metrics::Metrics;
use crate::transport::{
    event_channel, EventReceiver, InboundMessage, MqttTransport, Transport, TransportError,
    TransportEvent,
};


/// Connection state as last reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, no attempt reported yet
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// Broker accepted the connection
    Connected,
    /// Connection lost or refused; the transport is retrying
    Offline,
}

/// Lifecycle transitions observable by listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Online,
    Offline,
}

/// Key returned by [`BrokerConnection::on_lifecycle`], used to remove the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Zero-argument lifecycle callback
pub type LifecycleHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Listeners {
    online: Vec<(ListenerId, LifecycleHandler)>,
    offline: Vec<(ListenerId, LifecycleHandler)>,
}

impl Listeners {
    fn for_event(&self, event: LifecycleEvent) -> &Vec<(ListenerId, LifecycleHandler)> {
        match event {
            LifecycleEvent::Online => &self.online,
            LifecycleEvent::Offline => &self.offline,
        }
    }

    fn for_event_mut(
        &mut self,
        event: LifecycleEvent,
    ) -> &mut Vec<(ListenerId, LifecycleHandler)> {
        match event {
            LifecycleEvent::Online => &mut self.online,
            LifecycleEvent::Offline => &mut self.offline,
        }
    }
}

/// The process-wide broker connection
pub struct BrokerConnection {
    transport: Arc<dyn Transport>,
    endpoint: String,
    state: RwLock<ConnectionState>,
    listeners: RwLock<Listeners>,
    next_listener: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl BrokerConnection {
    /// Wrap an already running transport
    pub fn new(transport: Arc<dyn Transport>, endpoint: impl Into<String>) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            state: RwLock::new(ConnectionState::Connecting),
            listeners: RwLock::new(Listeners::default()),
            next_listener: AtomicU64::new(1),
            metrics: None,
        }
    }

    /// Start an MQTT transport for `config`.
    ///
    /// Returns immediately; the transport keeps retrying in the background
    /// and reports through the returned receiver, which must be handed to
    /// the multiplexer.
    pub fn connect(config: &BrokerConfig) -> (Self, EventReceiver) {
        let (events_tx, events_rx) = event_channel();
        let transport = MqttTransport::connect(config, events_tx);
        (Self::new(transport, config.url.clone()), events_rx)
    }

    /// Record connection metrics
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Broker endpoint this connection targets
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Register a callback for `event`.
    ///
    /// Callbacks run on the event pump in registration order. A panicking
    /// callback is logged and does not stop the ones after it.
    pub fn on_lifecycle<F>(&self, event: LifecycleEvent, handler: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .for_event_mut(event)
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a lifecycle callback. Unknown ids are ignored.
    pub fn off_lifecycle(&self, event: LifecycleEvent, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let list = listeners.for_event_mut(event);
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        list.len() != before
    }

    /// Number of callbacks registered for `event`
    pub fn listener_count(&self, event: LifecycleEvent) -> usize {
        self.listeners.read().for_event(event).len()
    }

    /// Apply a transport event to the connection state.
    ///
    /// Returns the message carried by `TransportEvent::Message` so the caller
    /// can route it.
    pub(crate) fn handle_event(&self, event: TransportEvent) -> Option<InboundMessage> {
        match event {
            TransportEvent::Connected => {
                let previous =
                    std::mem::replace(&mut *self.state.write(), ConnectionState::Connected);
                info!("BrokerConnection: Connected to {}", self.endpoint);
                if let Some(ref metrics) = self.metrics {
                    metrics.broker_online(previous == ConnectionState::Offline);
                }
                self.notify(LifecycleEvent::Online);
                None
            }
            TransportEvent::Disconnected(err) => {
                self.log_transport_error(&err);
                let previous =
                    std::mem::replace(&mut *self.state.write(), ConnectionState::Offline);
                if previous != ConnectionState::Offline {
                    warn!("BrokerConnection: Offline ({})", self.endpoint);
                    if let Some(ref metrics) = self.metrics {
                        metrics.broker_offline();
                    }
                    self.notify(LifecycleEvent::Offline);
                }
                None
            }
            TransportEvent::Message(message) => Some(message),
        }
    }

    fn log_transport_error(&self, err: &TransportError) {
        if err.is_connectivity() {
            debug!("BrokerConnection: {} ({})", err, self.endpoint);
        } else {
            error!("BrokerConnection: {} ({})", err, self.endpoint);
        }
        if let Some(ref metrics) = self.metrics {
            let class = if err.is_connectivity() {
                "connectivity"
            } else {
                "other"
            };
            metrics.transport_error(class);
        }
    }

    fn notify(&self, event: LifecycleEvent) {
        // Snapshot so callbacks may register or remove listeners
        let handlers: Vec<LifecycleHandler> = self
            .listeners
            .read()
            .for_event(event)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler())).is_err() {
                error!("BrokerConnection: {:?} listener panicked", event);
            }
        }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Disconnect from the broker and stop reconnecting
    pub async fn close(&self) -> Result<(), TransportError> {
        info!("BrokerConnection: Closing connection to {}", self.endpoint);
        let result = self.transport.disconnect().await;
        *self.state.write() = ConnectionState::Disconnected;
        result
    }
}
