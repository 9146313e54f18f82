//! Integration Tests for FanBridge
//!
//! Drive the whole stack through the public API: a scripted broker transport
//! at the bottom, real TCP clients on the WebSocket and SSE gateways at the
//! top.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;

use fanbridge::gateway::{self, HttpGateway, WebSocketGateway};
use fanbridge::transport::{event_channel, EventSender};
use fanbridge::{
    BrokerConnection, ConnectionBridge, ConnectionHandler, InboundMessage, Metrics,
    SubscriptionMultiplexer, Transport, TransportError, TransportEvent, TypedConsumer,
};

const TOPIC: &str = "plant/line1";

/// Broker transport that acknowledges everything and records requests
#[derive(Default)]
struct ScriptedBroker {
    requests: Mutex<Vec<String>>,
    refused: Mutex<HashSet<String>>,
}

impl ScriptedBroker {
    fn count(&self, request: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.as_str() == request)
            .count()
    }
}

#[async_trait]
impl Transport for ScriptedBroker {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.requests.lock().push(format!("SUBSCRIBE {}", topic));
        if self.refused.lock().contains(topic) {
            return Err(TransportError::Rejected("not authorized".to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.requests.lock().push(format!("UNSUBSCRIBE {}", topic));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.requests.lock().push("DISCONNECT".to_string());
        Ok(())
    }
}

struct Stack {
    broker: Arc<ScriptedBroker>,
    events: EventSender,
    multiplexer: Arc<SubscriptionMultiplexer>,
    metrics: Arc<Metrics>,
    http: SocketAddr,
    ws: SocketAddr,
    _shutdown: broadcast::Sender<()>,
}

impl Stack {
    async fn start() -> Self {
        let broker = Arc::new(ScriptedBroker::default());
        let metrics = Arc::new(Metrics::new());
        let (events, rx) = event_channel();

        let connection =
            BrokerConnection::new(broker.clone(), "mqtt://scripted:1883").with_metrics(metrics.clone());
        let multiplexer =
            SubscriptionMultiplexer::start_with_metrics(Arc::new(connection), rx, Some(metrics.clone()));

        let consumer: Arc<TypedConsumer<serde_json::Value>> =
            Arc::new(TypedConsumer::new(multiplexer.clone(), TOPIC));
        let bridge = ConnectionBridge::new(consumer, "mqtt");
        bridge.attach_lifecycle(multiplexer.connection());
        let handler: Arc<dyn ConnectionHandler> = Arc::new(bridge);

        let (shutdown, _) = broadcast::channel(1);

        let http_listener = gateway::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let http = http_listener.local_addr().unwrap();
        let http_gateway = HttpGateway::new(handler.clone(), "/api/events")
            .with_metrics(metrics.clone())
            .with_keep_alive(Duration::from_millis(100));
        tokio::spawn(http_gateway.serve(http_listener, shutdown.subscribe()));

        let ws_listener = gateway::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let ws = ws_listener.local_addr().unwrap();
        tokio::spawn(
            WebSocketGateway::new(handler, "/api/internal").serve(ws_listener, shutdown.subscribe()),
        );

        events.send(TransportEvent::Connected).unwrap();

        Self {
            broker,
            events,
            multiplexer,
            metrics,
            http,
            ws,
            _shutdown: shutdown,
        }
    }

    fn publish(&self, payload: &'static str) {
        self.events
            .send(TransportEvent::Message(InboundMessage::new(
                TOPIC,
                payload.as_bytes(),
            )))
            .unwrap();
    }

    async fn wait_for(&self, condition: impl Fn(&Self) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            self.multiplexer.flush().await;
            if condition(self) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

type WsClient =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

async fn ws_connect(stack: &Stack) -> WsClient {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/internal", stack.ws))
        .await
        .unwrap();
    client
}

async fn ws_next_text(client: &mut WsClient) -> String {
    loop {
        let message = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return text;
        }
    }
}

struct SseClient {
    stream: TcpStream,
    buffer: String,
}

impl SseClient {
    async fn connect(stack: &Stack) -> Self {
        let mut stream = TcpStream::connect(stack.http).await.unwrap();
        stream
            .write_all(b"GET /api/events HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        Self {
            stream,
            buffer: String::new(),
        }
    }

    /// Next `data:` line, skipping headers and keep-alive comments
    async fn next_data(&mut self) -> String {
        let mut chunk = [0u8; 2048];
        loop {
            if let Some(start) = self.buffer.find("data: ") {
                if let Some(len) = self.buffer[start..].find("\n\n") {
                    let data = self.buffer[start + 6..start + len].to_string();
                    self.buffer.drain(..start + len + 2);
                    return data;
                }
            }
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for event")
                .unwrap();
            assert!(n > 0, "event stream ended");
            self.buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));
        }
    }
}

#[tokio::test]
async fn test_websocket_and_sse_share_one_subscription() {
    let stack = Stack::start().await;

    let mut ws = ws_connect(&stack).await;
    let mut sse = SseClient::connect(&stack).await;
    stack
        .wait_for(|s| s.multiplexer.handler_count(TOPIC) == 2)
        .await;

    stack.publish(r#"{"temp":21.5}"#);

    let expected = r#"{"kind":"mqtt","payload":{"temp":21.5}}"#;
    assert_eq!(ws_next_text(&mut ws).await, expected);
    assert_eq!(sse.next_data().await, expected);
    assert_eq!(stack.broker.count(&format!("SUBSCRIBE {}", TOPIC)), 1);
}

#[tokio::test]
async fn test_last_close_unsubscribes() {
    let stack = Stack::start().await;

    let mut ws = ws_connect(&stack).await;
    let sse = SseClient::connect(&stack).await;
    stack
        .wait_for(|s| s.multiplexer.handler_count(TOPIC) == 2)
        .await;

    ws.close(None).await.unwrap();
    stack
        .wait_for(|s| s.multiplexer.handler_count(TOPIC) == 1)
        .await;
    assert_eq!(stack.broker.count(&format!("UNSUBSCRIBE {}", TOPIC)), 0);

    drop(sse);
    stack
        .wait_for(|s| s.broker.count(&format!("UNSUBSCRIBE {}", TOPIC)) == 1)
        .await;
    assert_eq!(stack.multiplexer.topic_count(), 0);
}

#[tokio::test]
async fn test_reconnect_resubscribes_and_reports_status() {
    let stack = Stack::start().await;

    let mut ws = ws_connect(&stack).await;
    stack.wait_for(|s| s.multiplexer.is_subscribed(TOPIC)).await;

    stack
        .events
        .send(TransportEvent::Disconnected(TransportError::ConnectionRefused))
        .unwrap();
    assert_eq!(
        ws_next_text(&mut ws).await,
        r#"{"kind":"status","payload":"offline"}"#
    );

    stack.events.send(TransportEvent::Connected).unwrap();
    assert_eq!(
        ws_next_text(&mut ws).await,
        r#"{"kind":"status","payload":"online"}"#
    );

    stack
        .wait_for(|s| s.broker.count(&format!("SUBSCRIBE {}", TOPIC)) == 2)
        .await;
    assert!(stack.multiplexer.is_subscribed(TOPIC));
    assert_eq!(stack.metrics.reconnects_total.get(), 1);

    stack.publish("\"after reconnect\"");
    assert_eq!(
        ws_next_text(&mut ws).await,
        r#"{"kind":"mqtt","payload":"after reconnect"}"#
    );
}

#[tokio::test]
async fn test_refused_subscribe_retried_by_next_connection() {
    let stack = Stack::start().await;
    stack.broker.refused.lock().insert(TOPIC.to_string());

    let _first = ws_connect(&stack).await;
    stack
        .wait_for(|s| s.broker.count(&format!("SUBSCRIBE {}", TOPIC)) == 1)
        .await;
    assert!(!stack.multiplexer.is_subscribed(TOPIC));

    stack.broker.refused.lock().clear();
    let _second = ws_connect(&stack).await;
    stack.wait_for(|s| s.multiplexer.is_subscribed(TOPIC)).await;
    assert_eq!(stack.broker.count(&format!("SUBSCRIBE {}", TOPIC)), 2);
}

#[tokio::test]
async fn test_bad_payload_does_not_break_stream() {
    let stack = Stack::start().await;
    let mut ws = ws_connect(&stack).await;
    stack
        .wait_for(|s| s.multiplexer.handler_count(TOPIC) == 1)
        .await;

    stack.publish("not json at all");
    stack.publish("[1]");

    assert_eq!(ws_next_text(&mut ws).await, r#"{"kind":"mqtt","payload":[1]}"#);
}

#[tokio::test]
async fn test_metrics_endpoint_reflects_traffic() {
    let stack = Stack::start().await;
    let mut ws = ws_connect(&stack).await;
    stack
        .wait_for(|s| s.multiplexer.handler_count(TOPIC) == 1)
        .await;
    stack.publish("1");
    ws_next_text(&mut ws).await;

    let mut stream = TcpStream::connect(stack.http).await.unwrap();
    stream
        .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("fanbridge_messages_received_total 1"));
    assert!(text.contains("fanbridge_topics_current 1"));
}
