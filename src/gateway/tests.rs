//! Gateway tests over real sockets

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::Message;

use super::*;
use crate::bridge::ConnectionHandler;
use crate::broadcast::{Channel, Framing};
use crate::metrics::Metrics;

#[derive(Default)]
struct RecordingHandler {
    open: Mutex<HashMap<String, Arc<dyn Channel>>>,
    closed: Mutex<Vec<String>>,
}

impl RecordingHandler {
    fn only_channel(&self) -> Option<Arc<dyn Channel>> {
        self.open.lock().values().next().cloned()
    }
}

impl ConnectionHandler for RecordingHandler {
    fn on_open(&self, identity: &str, channel: Arc<dyn Channel>) -> bool {
        self.open.lock().insert(identity.to_string(), channel);
        true
    }

    fn on_close(&self, identity: &str) -> bool {
        self.open.lock().remove(identity);
        self.closed.lock().push(identity.to_string());
        true
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn start_websocket(
    handler: Arc<RecordingHandler>,
) -> (SocketAddr, broadcast::Sender<()>) {
    let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = broadcast::channel(1);
    let gateway = WebSocketGateway::new(handler, "/api/internal");
    tokio::spawn(gateway.serve(listener, rx));
    (addr, shutdown)
}

async fn start_http(
    handler: Arc<RecordingHandler>,
    metrics: Option<Arc<Metrics>>,
) -> (SocketAddr, broadcast::Sender<()>) {
    let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = broadcast::channel(1);
    let mut gateway =
        HttpGateway::new(handler, "/api/events").with_keep_alive(Duration::from_millis(50));
    if let Some(metrics) = metrics {
        gateway = gateway.with_metrics(metrics);
    }
    tokio::spawn(gateway.serve(listener, rx));
    (addr, shutdown)
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test]
async fn test_websocket_open_send_close() {
    let handler = Arc::new(RecordingHandler::default());
    let (addr, _shutdown) = start_websocket(handler.clone()).await;

    let (mut client, _) =
        tokio_tungstenite::connect_async(format!("ws://{}/api/internal", addr))
            .await
            .unwrap();

    wait_until(|| handler.only_channel().is_some()).await;
    let channel = handler.only_channel().unwrap();
    assert_eq!(channel.framing(), Framing::Raw);
    channel.send(r#"{"kind":"mqtt","payload":1}"#).unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        message,
        Message::Text(r#"{"kind":"mqtt","payload":1}"#.to_string())
    );

    client.close(None).await.unwrap();
    wait_until(|| handler.closed.lock().len() == 1).await;
    assert!(handler.open.lock().is_empty());
    assert_eq!(handler.closed.lock()[0], channel.id());
}

#[tokio::test]
async fn test_websocket_identities_are_unique() {
    let handler = Arc::new(RecordingHandler::default());
    let (addr, _shutdown) = start_websocket(handler.clone()).await;
    let url = format!("ws://{}/api/internal", addr);

    let (_a, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (_b, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    wait_until(|| handler.open.lock().len() == 2).await;
}

#[tokio::test]
async fn test_websocket_rejects_wrong_path() {
    let handler = Arc::new(RecordingHandler::default());
    let (addr, _shutdown) = start_websocket(handler.clone()).await;

    let result = tokio_tungstenite::connect_async(format!("ws://{}/other", addr)).await;
    assert!(result.is_err());
    assert!(handler.open.lock().is_empty());
}

#[tokio::test]
async fn test_event_stream_open_send_close() {
    let handler = Arc::new(RecordingHandler::default());
    let (addr, _shutdown) = start_http(handler.clone(), None).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /api/events HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    wait_until(|| handler.only_channel().is_some()).await;
    let channel = handler.only_channel().unwrap();
    assert_eq!(channel.framing(), Framing::EventStream);
    channel.send("data: {\"kind\":\"mqtt\",\"payload\":2}\n\n").unwrap();

    let mut received = String::new();
    let mut buf = [0u8; 1024];
    while !received.contains("\"payload\":2") {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "stream ended early");
        received.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    assert!(received.starts_with("HTTP/1.1 200 OK"));
    assert!(received.contains("content-type: text/event-stream"));

    drop(stream);
    wait_until(|| handler.closed.lock().len() == 1).await;
    assert!(handler.open.lock().is_empty());
}

#[tokio::test]
async fn test_event_stream_requires_get() {
    let handler = Arc::new(RecordingHandler::default());
    let (addr, _shutdown) = start_http(handler.clone(), None).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"POST /api/events HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();

    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 405"));
    assert!(handler.open.lock().is_empty());
}

#[tokio::test]
async fn test_health_and_metrics_endpoints() {
    let handler = Arc::new(RecordingHandler::default());
    let metrics = Arc::new(Metrics::new());
    metrics.message_received(4);
    let (addr, _shutdown) = start_http(handler, Some(metrics)).await;

    let health = http_get(addr, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200 OK"));
    assert!(health.ends_with("OK"));

    let body = http_get(addr, "/metrics").await;
    assert!(body.starts_with("HTTP/1.1 200 OK"));
    assert!(body.contains("fanbridge_messages_received_total 1"));

    let missing = http_get(addr, "/nope").await;
    assert!(missing.starts_with("HTTP/1.1 404"));
}

#[tokio::test]
async fn test_metrics_disabled_is_not_found() {
    let handler = Arc::new(RecordingHandler::default());
    let (addr, _shutdown) = start_http(handler, None).await;

    let response = http_get(addr, "/metrics").await;
    assert!(response.starts_with("HTTP/1.1 404"));
}

#[tokio::test]
async fn test_shutdown_stops_accept_loop() {
    let handler = Arc::new(RecordingHandler::default());
    let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let (shutdown, rx) = broadcast::channel(1);
    let task = tokio::spawn(WebSocketGateway::new(handler, "/ws").serve(listener, rx));

    shutdown.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}
