//! Subscription Multiplexer
//!
//! Shares one broker subscription per topic between any number of handlers.
//! The first handler on a topic triggers a broker subscribe, the last one to
//! leave triggers an unsubscribe, and every inbound message is dispatched to
//! all handlers of its exact topic in registration order.
//!
//! `add_handler` and `remove_handler` never await. Broker requests are queued
//! on a command channel and issued one at a time by a subscription worker,
//! which records the acknowledgement outcome on the topic entry. The worker
//! only unsubscribes topics it actually subscribed during the current broker
//! session.

use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::connection::BrokerConnection;
use crate::consumer::DecodeError;
use crate::metrics::Metrics;
use crate::transport::{
    EventReceiver, InboundMessage, MessageMeta, TransportError, TransportEvent,
};


/// Callback invoked with `(topic, payload, meta)` for every message on its topic
pub type RawHandler =
    Arc<dyn Fn(&str, &Bytes, &MessageMeta) -> Result<(), HandlerError> + Send + Sync>;

/// Key returned by [`SubscriptionMultiplexer::add_handler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Error returned by a handler; logged at the dispatch boundary
#[derive(Debug)]
pub enum HandlerError {
    /// Payload could not be decoded for this identity
    Decode { identity: String, error: DecodeError },
    /// Handler-specific failure
    Failed(String),
}

impl HandlerError {
    /// Short label used for the failure metric
    pub fn reason(&self) -> &'static str {
        match self {
            HandlerError::Decode { .. } => "decode",
            HandlerError::Failed(_) => "error",
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Decode { identity, error } => {
                write!(f, "Decode failed for '{}': {}", identity, error)
            }
            HandlerError::Failed(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Broker-side state of a topic subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Requested, not yet acknowledged (or deferred while offline)
    Pending,
    /// Broker acknowledged the subscribe
    Acknowledged,
    /// Broker refused the subscribe or the request was lost
    Failed,
}

struct TopicEntry {
    handlers: Vec<(HandlerId, RawHandler)>,
    state: SubscriptionState,
    /// Identifies the latest subscribe request; older acks are ignored
    generation: u64,
}

type TopicTable = Arc<DashMap<String, TopicEntry, ahash::RandomState>>;

enum Command {
    Subscribe { topic: String, generation: u64 },
    Unsubscribe { topic: String },
    /// Broker session lost; nothing is subscribed any more
    Offline,
    Flush(oneshot::Sender<()>),
}

/// Per-topic handler registry over a single broker connection
pub struct SubscriptionMultiplexer {
    connection: Arc<BrokerConnection>,
    topics: TopicTable,
    commands: mpsc::UnboundedSender<Command>,
    next_handler: AtomicU64,
    next_generation: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    metrics: Option<Arc<Metrics>>,
}

impl SubscriptionMultiplexer {
    /// Take ownership of the connection and start routing its events.
    ///
    /// Spawns the event pump (consuming `events`) and the subscription
    /// worker. Must be called inside a Tokio runtime.
    pub fn start(connection: Arc<BrokerConnection>, events: EventReceiver) -> Arc<Self> {
        Self::start_with_metrics(connection, events, None)
    }

    /// Same as [`start`](Self::start), recording multiplexer metrics
    pub fn start_with_metrics(
        connection: Arc<BrokerConnection>,
        events: EventReceiver,
        metrics: Option<Arc<Metrics>>,
    ) -> Arc<Self> {
        let topics: TopicTable = Arc::new(DashMap::with_hasher(ahash::RandomState::new()));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(run_worker(
            command_rx,
            topics.clone(),
            connection.clone(),
            metrics.clone(),
        ));

        let multiplexer = Arc::new(Self {
            connection,
            topics,
            commands,
            next_handler: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
            metrics,
        });

        let pump = tokio::spawn(run_pump(events, Arc::downgrade(&multiplexer)));
        multiplexer.tasks.lock().extend([worker, pump]);
        multiplexer
    }

    /// Register `handler` for the exact `topic`.
    ///
    /// The first handler on a topic queues a broker subscribe; later handlers
    /// only join the list, unless the last subscribe failed, in which case it
    /// is retried.
    pub fn add_handler<F>(&self, topic: &str, handler: F) -> HandlerId
    where
        F: Fn(&str, &Bytes, &MessageMeta) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        let handler: RawHandler = Arc::new(handler);

        match self.topics.entry(topic.to_string()) {
            Entry::Occupied(mut e) => {
                let entry = e.get_mut();
                entry.handlers.push((id, handler));
                if entry.state == SubscriptionState::Failed {
                    debug!("Multiplexer: Retrying failed subscribe to '{}'", topic);
                    self.request_subscribe(topic, entry);
                }
            }
            Entry::Vacant(e) => {
                let mut entry = e.insert(TopicEntry {
                    handlers: vec![(id, handler)],
                    state: SubscriptionState::Pending,
                    generation: 0,
                });
                debug!("Multiplexer: First handler on '{}', subscribing", topic);
                self.request_subscribe(topic, entry.value_mut());
                if let Some(ref metrics) = self.metrics {
                    metrics.topic_added();
                }
            }
        }

        if let Some(ref metrics) = self.metrics {
            metrics.handler_added();
        }
        id
    }

    /// Remove a handler. Returns false for an unknown topic or id.
    ///
    /// Removing the last handler of a topic drops the topic and queues a
    /// broker unsubscribe.
    pub fn remove_handler(&self, topic: &str, id: HandlerId) -> bool {
        let Entry::Occupied(mut e) = self.topics.entry(topic.to_string()) else {
            return false;
        };

        let handlers = &mut e.get_mut().handlers;
        let Some(position) = handlers.iter().position(|(existing, _)| *existing == id) else {
            return false;
        };
        handlers.remove(position);
        let now_empty = handlers.is_empty();

        if let Some(ref metrics) = self.metrics {
            metrics.handler_removed();
        }

        if now_empty {
            debug!("Multiplexer: Last handler left '{}', unsubscribing", topic);
            // Queued under the entry lock so it orders before any re-subscribe
            self.send(Command::Unsubscribe {
                topic: topic.to_string(),
            });
            e.remove();
            if let Some(ref metrics) = self.metrics {
                metrics.topic_removed();
            }
        }
        true
    }

    /// Feed one transport event through the connection and route any message
    pub fn process(&self, event: TransportEvent) {
        let online = matches!(event, TransportEvent::Connected);
        let offline = matches!(event, TransportEvent::Disconnected(_));

        if let Some(message) = self.connection.handle_event(event) {
            self.deliver(&message);
        }

        if offline {
            self.send(Command::Offline);
        }
        if online {
            self.resubscribe_all();
        }
    }

    /// Invoke every handler registered for the message's topic.
    ///
    /// Runs over a snapshot of the handler list, so handlers may add or
    /// remove registrations. Returns the number of handlers invoked.
    pub fn deliver(&self, message: &InboundMessage) -> usize {
        let started = Instant::now();
        if let Some(ref metrics) = self.metrics {
            metrics.message_received(message.payload.len());
        }

        let snapshot: Vec<RawHandler> = match self.topics.get(&message.topic) {
            Some(entry) => entry.handlers.iter().map(|(_, h)| h.clone()).collect(),
            None => {
                trace!("Multiplexer: No handlers for '{}'", message.topic);
                if let Some(ref metrics) = self.metrics {
                    metrics.message_unrouted();
                }
                return 0;
            }
        };

        for handler in &snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                handler(&message.topic, &message.payload, &message.meta)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Multiplexer: Handler on '{}' failed: {}", message.topic, e);
                    if let Some(ref metrics) = self.metrics {
                        metrics.handler_failed(e.reason());
                    }
                }
                Err(_) => {
                    error!("Multiplexer: Handler on '{}' panicked", message.topic);
                    if let Some(ref metrics) = self.metrics {
                        metrics.handler_failed("panic");
                    }
                }
            }
        }

        if let Some(ref metrics) = self.metrics {
            metrics
                .dispatch_duration
                .observe(started.elapsed().as_secs_f64());
        }
        snapshot.len()
    }

    /// Wait until every broker request queued so far has completed
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    /// Number of topics with at least one handler
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|entry| entry.handlers.len())
            .unwrap_or(0)
    }

    pub fn subscription_state(&self, topic: &str) -> Option<SubscriptionState> {
        self.topics.get(topic).map(|entry| entry.state)
    }

    /// Whether the broker has acknowledged the current subscription
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscription_state(topic) == Some(SubscriptionState::Acknowledged)
    }

    /// Topics with at least one handler
    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Drain queued requests, stop the background tasks and close the connection
    pub async fn shutdown(&self) {
        self.flush().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Err(e) = self.connection.close().await {
            debug!("Multiplexer: Error closing connection: {}", e);
        }
        info!("Multiplexer: Shut down");
    }

    fn resubscribe_all(&self) {
        let mut count = 0;
        for mut entry in self.topics.iter_mut() {
            let topic = entry.key().clone();
            self.request_subscribe(&topic, entry.value_mut());
            count += 1;
        }
        if count > 0 {
            info!("Multiplexer: Resubscribing {} topic(s) after reconnect", count);
        }
    }

    fn request_subscribe(&self, topic: &str, entry: &mut TopicEntry) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        entry.generation = generation;
        entry.state = SubscriptionState::Pending;
        self.send(Command::Subscribe {
            topic: topic.to_string(),
            generation,
        });
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Multiplexer: Subscription worker stopped, request dropped");
        }
    }
}

async fn run_pump(mut events: EventReceiver, multiplexer: Weak<SubscriptionMultiplexer>) {
    while let Some(event) = events.recv().await {
        let Some(multiplexer) = multiplexer.upgrade() else {
            break;
        };
        multiplexer.process(event);
    }
    debug!("Multiplexer: Event pump stopped");
}

fn is_current(topics: &TopicTable, topic: &str, generation: u64) -> bool {
    topics
        .get(topic)
        .map(|entry| entry.generation == generation)
        .unwrap_or(false)
}

async fn run_worker(
    mut commands: mpsc::UnboundedReceiver<Command>,
    topics: TopicTable,
    connection: Arc<BrokerConnection>,
    metrics: Option<Arc<Metrics>>,
) {
    // Topics the broker may currently hold a subscription for
    let mut active: HashSet<String> = HashSet::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Subscribe { topic, generation } => {
                if !is_current(&topics, &topic, generation) {
                    trace!("Multiplexer: Skipping superseded subscribe to '{}'", topic);
                    continue;
                }
                if !connection.is_connected() {
                    // Re-issued on the next online transition
                    debug!("Multiplexer: Broker offline, deferring subscribe to '{}'", topic);
                    continue;
                }

                let result = connection.transport().subscribe(&topic).await;
                if let Some(ref metrics) = metrics {
                    metrics.subscribe_request("subscribe", result.is_ok());
                }
                // A timed-out request may still have been applied
                if matches!(result, Ok(()) | Err(TransportError::Timeout)) {
                    active.insert(topic.clone());
                }

                if let Some(mut entry) = topics.get_mut(&topic) {
                    if entry.generation == generation {
                        entry.state = if result.is_ok() {
                            SubscriptionState::Acknowledged
                        } else {
                            SubscriptionState::Failed
                        };
                    }
                }

                match result {
                    Ok(()) => debug!("Multiplexer: Subscribed to '{}'", topic),
                    Err(e) => warn!("Multiplexer: Subscribe to '{}' failed: {}", topic, e),
                }
            }
            Command::Unsubscribe { topic } => {
                if !active.remove(&topic) {
                    trace!(
                        "Multiplexer: '{}' was never subscribed, skipping unsubscribe",
                        topic
                    );
                    continue;
                }
                if !connection.is_connected() {
                    debug!("Multiplexer: Broker offline, dropping unsubscribe from '{}'", topic);
                    continue;
                }

                let result = connection.transport().unsubscribe(&topic).await;
                if let Some(ref metrics) = metrics {
                    metrics.subscribe_request("unsubscribe", result.is_ok());
                }
                match result {
                    Ok(()) => debug!("Multiplexer: Unsubscribed from '{}'", topic),
                    Err(e) => warn!("Multiplexer: Unsubscribe from '{}' failed: {}", topic, e),
                }
            }
            Command::Offline => {
                active.clear();
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Multiplexer: Subscription worker stopped");
}
