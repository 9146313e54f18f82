//! FanBridge - one broker connection, many downstream consumers
//!
//! Shares a single MQTT connection between any number of features and
//! browser connections. Topic subscriptions are de-duplicated, inbound
//! messages are fanned out to every registered handler, and decoded events
//! are pushed to WebSocket and Server-Sent Events clients.

pub mod bridge;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod gateway;
pub mod metrics;
pub mod multiplexer;
pub mod transport;

pub use bridge::{ConnectionBridge, ConnectionHandler};
pub use broadcast::{Broadcaster, Channel, Event, Framing, MpscChannel, SendError};
pub use config::{Config, Settings};
pub use connection::{BrokerConnection, ConnectionState, LifecycleEvent, ListenerId};
pub use consumer::{DecodeError, JsonDecoder, PayloadDecoder, TextDecoder, TypedConsumer};
pub use gateway::{GatewayError, HttpGateway, WebSocketGateway};
pub use metrics::Metrics;
pub use multiplexer::{HandlerError, HandlerId, SubscriptionMultiplexer, SubscriptionState};
pub use transport::{InboundMessage, MessageMeta, Transport, TransportError, TransportEvent};
