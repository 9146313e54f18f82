//! Prometheus metrics for FanBridge
//!
//! Exposed at /metrics on the gateway HTTP server.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};


/// All FanBridge metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Broker connection
    pub broker_connected: IntGauge,
    pub reconnects_total: IntCounter,
    pub transport_errors_total: IntCounterVec,

    // Multiplexer
    pub messages_received_total: IntCounter,
    pub messages_bytes_received: IntCounter,
    pub messages_unrouted_total: IntCounter,
    pub handler_failures_total: IntCounterVec,
    pub topics_current: IntGauge,
    pub handlers_current: IntGauge,
    pub subscribe_requests_total: IntCounterVec,
    pub dispatch_duration: Histogram,

    // Broadcaster
    pub channels_current: IntGaugeVec,
    pub broadcasts_total: IntCounter,
    pub sends_total: IntCounter,
    pub send_failures_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let broker_connected = IntGauge::with_opts(Opts::new(
            "fanbridge_broker_connected",
            "1 while the broker connection is up",
        ))
        .unwrap();

        let reconnects_total = IntCounter::with_opts(Opts::new(
            "fanbridge_broker_reconnects_total",
            "Offline to online transitions since startup",
        ))
        .unwrap();

        let transport_errors_total = IntCounterVec::new(
            Opts::new(
                "fanbridge_transport_errors_total",
                "Transport errors by class",
            ),
            &["class"],
        )
        .unwrap();

        let messages_received_total = IntCounter::with_opts(Opts::new(
            "fanbridge_messages_received_total",
            "Messages received from the broker",
        ))
        .unwrap();

        let messages_bytes_received = IntCounter::with_opts(Opts::new(
            "fanbridge_messages_bytes_received_total",
            "Payload bytes received from the broker",
        ))
        .unwrap();

        let messages_unrouted_total = IntCounter::with_opts(Opts::new(
            "fanbridge_messages_unrouted_total",
            "Messages received for a topic with no handlers",
        ))
        .unwrap();

        let handler_failures_total = IntCounterVec::new(
            Opts::new(
                "fanbridge_handler_failures_total",
                "Handler invocations that returned an error or panicked",
            ),
            &["reason"],
        )
        .unwrap();

        let topics_current = IntGauge::with_opts(Opts::new(
            "fanbridge_topics_current",
            "Topics with at least one registered handler",
        ))
        .unwrap();

        let handlers_current = IntGauge::with_opts(Opts::new(
            "fanbridge_handlers_current",
            "Registered handlers across all topics",
        ))
        .unwrap();

        let subscribe_requests_total = IntCounterVec::new(
            Opts::new(
                "fanbridge_subscribe_requests_total",
                "Broker subscribe/unsubscribe requests by kind and outcome",
            ),
            &["kind", "outcome"],
        )
        .unwrap();

        let dispatch_duration = Histogram::with_opts(
            HistogramOpts::new(
                "fanbridge_dispatch_duration_seconds",
                "Time to run every handler for one inbound message",
            )
            .buckets(vec![
                0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1,
            ]),
        )
        .unwrap();

        let channels_current = IntGaugeVec::new(
            Opts::new(
                "fanbridge_channels_current",
                "Registered downstream channels by framing",
            ),
            &["framing"],
        )
        .unwrap();

        let broadcasts_total = IntCounter::with_opts(Opts::new(
            "fanbridge_broadcasts_total",
            "Broadcasts that reached at least one channel",
        ))
        .unwrap();

        let sends_total = IntCounter::with_opts(Opts::new(
            "fanbridge_sends_total",
            "Frames written to downstream channels",
        ))
        .unwrap();

        let send_failures_total = IntCounter::with_opts(Opts::new(
            "fanbridge_send_failures_total",
            "Frames that could not be written to a downstream channel",
        ))
        .unwrap();

        registry
            .register(Box::new(broker_connected.clone()))
            .unwrap();
        registry
            .register(Box::new(reconnects_total.clone()))
            .unwrap();
        registry
            .register(Box::new(transport_errors_total.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_received_total.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_bytes_received.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_unrouted_total.clone()))
            .unwrap();
        registry
            .register(Box::new(handler_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(topics_current.clone()))
            .unwrap();
        registry
            .register(Box::new(handlers_current.clone()))
            .unwrap();
        registry
            .register(Box::new(subscribe_requests_total.clone()))
            .unwrap();
        registry
            .register(Box::new(dispatch_duration.clone()))
            .unwrap();
        registry
            .register(Box::new(channels_current.clone()))
            .unwrap();
        registry
            .register(Box::new(broadcasts_total.clone()))
            .unwrap();
        registry.register(Box::new(sends_total.clone())).unwrap();
        registry
            .register(Box::new(send_failures_total.clone()))
            .unwrap();

        Metrics {
            registry,
            broker_connected,
            reconnects_total,
            transport_errors_total,
            messages_received_total,
            messages_bytes_received,
            messages_unrouted_total,
            handler_failures_total,
            topics_current,
            handlers_current,
            subscribe_requests_total,
            dispatch_duration,
            channels_current,
            broadcasts_total,
            sends_total,
            send_failures_total,
        }
    }

    /// Render every metric in the Prometheus text format
    pub fn encode(&self) -> Result<(Vec<u8>, String), prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((buffer, encoder.format_type().to_string()))
    }

    // Broker helpers

    pub fn broker_online(&self, reconnect: bool) {
        self.broker_connected.set(1);
        if reconnect {
            self.reconnects_total.inc();
        }
    }

    pub fn broker_offline(&self) {
        self.broker_connected.set(0);
    }

    pub fn transport_error(&self, class: &str) {
        self.transport_errors_total.with_label_values(&[class]).inc();
    }

    // Multiplexer helpers

    pub fn message_received(&self, bytes: usize) {
        self.messages_received_total.inc();
        self.messages_bytes_received.inc_by(bytes as u64);
    }

    pub fn message_unrouted(&self) {
        self.messages_unrouted_total.inc();
    }

    pub fn handler_failed(&self, reason: &str) {
        self.handler_failures_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn topic_added(&self) {
        self.topics_current.inc();
    }

    pub fn topic_removed(&self) {
        self.topics_current.dec();
    }

    pub fn handler_added(&self) {
        self.handlers_current.inc();
    }

    pub fn handler_removed(&self) {
        self.handlers_current.dec();
    }

    pub fn subscribe_request(&self, kind: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        self.subscribe_requests_total
            .with_label_values(&[kind, outcome])
            .inc();
    }

    // Broadcaster helpers

    pub fn channel_registered(&self, framing: &str) {
        self.channels_current.with_label_values(&[framing]).inc();
    }

    pub fn channel_unregistered(&self, framing: &str) {
        self.channels_current.with_label_values(&[framing]).dec();
    }

    pub fn broadcast_sent(&self, delivered: usize, failed: usize) {
        if delivered > 0 {
            self.broadcasts_total.inc();
        }
        self.sends_total.inc_by(delivered as u64);
        self.send_failures_total.inc_by(failed as u64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
