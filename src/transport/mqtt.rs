//! MQTT Transport
//!
//! [`Transport`] implementation over `rumqttc`. One `AsyncClient` /
//! `EventLoop` pair is created per process; the event loop runs on its own
//! task and translates rumqttc events into [`TransportEvent`]s.
//!
//! rumqttc does not tell callers when a SUBSCRIBE is acknowledged, so the
//! transport correlates requests with SUBACK/UNSUBACK itself: requests are
//! queued in the order they are handed to the client, matched to packet ids
//! when the event loop reports them as outgoing, and completed when the ack
//! with that packet id arrives.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode,
};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::{EventSender, InboundMessage, MessageMeta, Transport, TransportError, TransportEvent};
use crate::config::BrokerConfig;

type AckSender = oneshot::Sender<Result<(), TransportError>>;

/// Outstanding subscribe/unsubscribe requests
#[derive(Default)]
struct AckState {
    /// Subscribes handed to the client but not yet written
    queued_subscribes: VecDeque<AckSender>,
    /// Unsubscribes handed to the client but not yet written
    queued_unsubscribes: VecDeque<AckSender>,
    /// Requests written to the socket, keyed by packet id
    inflight: HashMap<u16, AckSender>,
}

impl AckState {
    fn sent_subscribe(&mut self, pkid: u16) {
        if let Some(tx) = self.queued_subscribes.pop_front() {
            self.track(pkid, tx);
        }
    }

    fn sent_unsubscribe(&mut self, pkid: u16) {
        if let Some(tx) = self.queued_unsubscribes.pop_front() {
            self.track(pkid, tx);
        }
    }

    /// Queued entries stay until written so packet ids keep lining up; a
    /// caller that already timed out is simply not tracked any further.
    fn track(&mut self, pkid: u16, tx: AckSender) {
        if !tx.is_closed() {
            self.inflight.insert(pkid, tx);
        }
    }

    /// Drop written requests whose caller stopped waiting
    fn prune(&mut self) {
        self.inflight.retain(|_, tx| !tx.is_closed());
    }

    fn complete(&mut self, pkid: u16, result: Result<(), TransportError>) {
        if let Some(tx) = self.inflight.remove(&pkid) {
            let _ = tx.send(result);
        }
    }

    /// Fail everything already on the wire; queued requests survive the
    /// reconnect because rumqttc keeps them in its request channel.
    fn fail_inflight(&mut self, reason: &str) {
        for (_, tx) in self.inflight.drain() {
            let _ = tx.send(Err(TransportError::ConnectionLost(reason.to_string())));
        }
    }
}

fn suback_result(suback: &SubAck) -> Result<(), TransportError> {
    if suback
        .return_codes
        .iter()
        .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
    {
        Ok(())
    } else {
        Err(TransportError::Rejected(format!(
            "SUBACK failure for packet {}",
            suback.pkid
        )))
    }
}

impl From<ConnectionError> for TransportError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Io(e) => e.into(),
            ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
                TransportError::Timeout
            }
            ConnectionError::ConnectionRefused(code) => {
                TransportError::Rejected(format!("CONNACK return code {:?}", code))
            }
            other => TransportError::ConnectionLost(other.to_string()),
        }
    }
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// MQTT transport backed by rumqttc
pub struct MqttTransport {
    client: AsyncClient,
    acks: Arc<Mutex<AckState>>,
    qos: QoS,
    ack_timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

impl MqttTransport {
    /// Build the client and spawn its event loop.
    ///
    /// Never fails on an unreachable broker: the event loop keeps retrying
    /// every `reconnect_period` and reports each attempt through `events`.
    pub fn connect(config: &BrokerConfig, events: EventSender) -> Arc<Self> {
        let (host, port) = config.parse_endpoint();

        let mut options = MqttOptions::new(config.client_id.clone(), host.clone(), port);
        options.set_clean_session(true);
        options.set_keep_alive(config.keep_alive_duration());

        let (client, eventloop) = AsyncClient::new(options, config.request_capacity);

        let acks = Arc::new(Mutex::new(AckState::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        info!(
            "MqttTransport: Connecting to {}:{} as '{}'",
            host, port, config.client_id
        );

        tokio::spawn(run_event_loop(
            eventloop,
            events,
            acks.clone(),
            shutdown.clone(),
            config.connect_timeout_duration(),
            config.reconnect_period_duration(),
        ));

        Arc::new(Self {
            client,
            acks,
            qos: qos_from_level(config.qos),
            ack_timeout: config.ack_timeout_duration(),
            shutdown,
        })
    }

    async fn await_ack(
        &self,
        rx: oneshot::Receiver<Result<(), TransportError>>,
    ) -> Result<(), TransportError> {
        let outcome = timeout(self.ack_timeout, rx).await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionLost(
                "Event loop stopped".to_string(),
            )),
            Err(_) => {
                // The receiver was dropped with the timeout, closing its sender
                self.acks.lock().prune();
                Err(TransportError::Timeout)
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        {
            // Held across try_subscribe so queue order matches request order
            let mut acks = self.acks.lock();
            self.client
                .try_subscribe(topic, self.qos)
                .map_err(|e| TransportError::RequestFailed(e.to_string()))?;
            acks.queued_subscribes.push_back(tx);
        }
        self.await_ack(rx).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut acks = self.acks.lock();
            self.client
                .try_unsubscribe(topic)
                .map_err(|e| TransportError::RequestFailed(e.to_string()))?;
            acks.queued_unsubscribes.push_back(tx);
        }
        self.await_ack(rx).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::RequestFailed(e.to_string()))
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    events: EventSender,
    acks: Arc<Mutex<AckState>>,
    shutdown: Arc<AtomicBool>,
    connect_timeout: Duration,
    reconnect_period: Duration,
) {
    let mut connected = false;

    loop {
        let polled = if connected {
            eventloop.poll().await.map_err(TransportError::from)
        } else {
            match timeout(connect_timeout, eventloop.poll()).await {
                Ok(result) => result.map_err(TransportError::from),
                Err(_) => Err(TransportError::Timeout),
            }
        };

        let forwarded = match polled {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                connected = true;
                debug!(
                    "MqttTransport: CONNACK received (session_present={})",
                    connack.session_present
                );
                events.send(TransportEvent::Connected)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                    meta: MessageMeta {
                        qos: publish.qos as u8,
                        retain: publish.retain,
                        dup: publish.dup,
                        packet_id: publish.pkid,
                    },
                };
                events.send(TransportEvent::Message(message))
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                acks.lock().complete(suback.pkid, suback_result(&suback));
                Ok(())
            }
            Ok(Event::Incoming(Packet::UnsubAck(unsuback))) => {
                acks.lock().complete(unsuback.pkid, Ok(()));
                Ok(())
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                acks.lock().sent_subscribe(pkid);
                Ok(())
            }
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                acks.lock().sent_unsubscribe(pkid);
                Ok(())
            }
            Ok(event) => {
                trace!("MqttTransport: {:?}", event);
                Ok(())
            }
            Err(e) => {
                if shutdown.load(Ordering::SeqCst) {
                    debug!("MqttTransport: Event loop stopped after disconnect");
                    acks.lock().fail_inflight("disconnected");
                    return;
                }

                connected = false;
                acks.lock().fail_inflight(&e.to_string());
                let forwarded = events.send(TransportEvent::Disconnected(e));
                tokio::time::sleep(reconnect_period).await;
                forwarded
            }
        };

        if forwarded.is_err() {
            warn!("MqttTransport: Event receiver dropped, stopping event loop");
            return;
        }
    }
}
