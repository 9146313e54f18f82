//! Bridge Module Tests

use pretty_assertions::assert_eq;
use tokio::sync::mpsc::UnboundedReceiver;

use super::*;
use crate::broadcast::{Framing, MpscChannel};
use crate::multiplexer::SubscriptionMultiplexer;
use crate::transport::mock::MockTransport;
use crate::transport::{
    event_channel, EventSender, InboundMessage, TransportError, TransportEvent,
};

struct Harness {
    multiplexer: Arc<SubscriptionMultiplexer>,
    transport: Arc<MockTransport>,
    bridge: ConnectionBridge<serde_json::Value>,
    _events: EventSender,
}

fn harness() -> Harness {
    let transport = Arc::new(MockTransport::new());
    let connection = Arc::new(BrokerConnection::new(transport.clone(), "mqtt://test:1883"));
    let (events, rx) = event_channel();
    let multiplexer = SubscriptionMultiplexer::start(connection, rx);
    multiplexer.process(TransportEvent::Connected);

    let consumer = Arc::new(TypedConsumer::new(multiplexer.clone(), "mqtt/topic"));
    let bridge = ConnectionBridge::new(consumer, "mqtt");
    Harness {
        multiplexer,
        transport,
        bridge,
        _events: events,
    }
}

fn publish(h: &Harness, payload: &'static str) {
    h.multiplexer
        .deliver(&InboundMessage::new("mqtt/topic", payload.as_bytes()));
}

fn open(h: &Harness, identity: &str, framing: Framing) -> UnboundedReceiver<String> {
    let (channel, rx) = MpscChannel::new(identity, framing);
    assert!(h.bridge.on_open(identity, channel));
    rx
}

fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<String> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

#[tokio::test]
async fn test_open_publish_close() {
    let h = harness();
    let mut rx = open(&h, "c1", Framing::EventStream);
    h.multiplexer.flush().await;

    publish(&h, r#"{"temp":21}"#);
    assert_eq!(
        drain(&mut rx),
        vec!["data: {\"kind\":\"mqtt\",\"payload\":{\"temp\":21}}\n\n".to_string()]
    );

    assert!(h.bridge.on_close("c1"));
    h.multiplexer.flush().await;
    assert_eq!(h.transport.subscribe_count("mqtt/topic"), 1);
    assert_eq!(h.transport.unsubscribe_count("mqtt/topic"), 1);
    assert_eq!(h.bridge.connection_count(), 0);

    publish(&h, r#"{"temp":22}"#);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_two_connections_get_one_identical_send_each() {
    let h = harness();
    let mut a = open(&h, "a", Framing::Raw);
    let mut b = open(&h, "b", Framing::Raw);

    publish(&h, r#"[1,2,3]"#);

    let a_frames = drain(&mut a);
    let b_frames = drain(&mut b);
    assert_eq!(a_frames, vec![r#"{"kind":"mqtt","payload":[1,2,3]}"#.to_string()]);
    assert_eq!(a_frames, b_frames);

    h.multiplexer.flush().await;
    assert_eq!(h.transport.subscribe_count("mqtt/topic"), 1);
}

#[tokio::test]
async fn test_close_keeps_other_connections() {
    let h = harness();
    let _a = open(&h, "a", Framing::Raw);
    let mut b = open(&h, "b", Framing::Raw);

    h.bridge.on_close("a");
    publish(&h, "true");

    assert_eq!(drain(&mut b).len(), 1);
    h.multiplexer.flush().await;
    assert_eq!(h.transport.unsubscribe_count("mqtt/topic"), 0);
}

#[tokio::test]
async fn test_duplicate_open_and_unknown_close() {
    let h = harness();
    let _rx = open(&h, "a", Framing::Raw);

    let (again, _again_rx) = MpscChannel::new("a", Framing::Raw);
    assert!(!h.bridge.on_open("a", again));
    assert_eq!(h.bridge.connection_count(), 1);
    assert_eq!(h.bridge.broadcaster().channel_count(), 1);

    assert!(!h.bridge.on_close("nobody"));
    assert!(h.bridge.on_close("a"));
    assert!(!h.bridge.on_close("a"));
}

#[tokio::test]
async fn test_invalid_payload_is_skipped() {
    let h = harness();
    let mut rx = open(&h, "a", Framing::Raw);

    publish(&h, "{broken");
    publish(&h, r#""ok""#);

    assert_eq!(
        drain(&mut rx),
        vec![r#"{"kind":"mqtt","payload":"ok"}"#.to_string()]
    );
}

#[tokio::test]
async fn test_lifecycle_status_events() {
    let h = harness();
    h.bridge.attach_lifecycle(h.multiplexer.connection());
    let mut raw = open(&h, "ws", Framing::Raw);
    let mut sse = open(&h, "sse", Framing::EventStream);

    h.multiplexer
        .process(TransportEvent::Disconnected(TransportError::ConnectionRefused));
    h.multiplexer.process(TransportEvent::Connected);

    assert_eq!(
        drain(&mut raw),
        vec![
            r#"{"kind":"status","payload":"offline"}"#.to_string(),
            r#"{"kind":"status","payload":"online"}"#.to_string(),
        ]
    );
    assert_eq!(
        drain(&mut sse),
        vec![
            "data: {\"kind\":\"status\",\"payload\":\"offline\"}\n\n".to_string(),
            "data: {\"kind\":\"status\",\"payload\":\"online\"}\n\n".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_bridge_as_connection_handler() {
    let h = harness();
    let handler: &dyn ConnectionHandler = &h.bridge;

    let (channel, mut rx) = MpscChannel::new("dyn", Framing::Raw);
    assert!(handler.on_open("dyn", channel));
    publish(&h, "1");
    assert_eq!(drain(&mut rx).len(), 1);
    assert!(handler.on_close("dyn"));
    assert!(!h.bridge.is_open("dyn"));
}

#[tokio::test]
async fn test_shared_channel_id_is_rejected() {
    let h = harness();
    let (first, _first_rx) = MpscChannel::new("shared", Framing::Raw);
    let (second, _second_rx) = MpscChannel::new("shared", Framing::Raw);

    assert!(h.bridge.on_open("a", first));
    assert!(!h.bridge.on_open("b", second));
    assert!(!h.bridge.is_open("b"));
    assert!(!h.bridge.consumer().is_subscribed("b"));
    assert_eq!(h.multiplexer.handler_count("mqtt/topic"), 1);
    assert_eq!(h.bridge.broadcaster().channel_count(), 1);

    assert!(h.bridge.on_close("a"));
    assert_eq!(h.bridge.broadcaster().channel_count(), 0);
}
