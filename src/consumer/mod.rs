//! Typed Consumer
//!
//! Lets independent features listen to one topic under their own identity.
//! Each identity gets its own raw handler on the multiplexer, so removing one
//! never disturbs the others. Payloads are decoded per registration; a
//! payload that fails to decode is reported for that identity only.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::multiplexer::{HandlerError, HandlerId, SubscriptionMultiplexer};
use crate::transport::MessageMeta;


/// Error produced when a payload cannot be turned into the consumer's type
#[derive(Debug)]
pub enum DecodeError {
    /// Payload is not valid JSON for the target type
    Json(serde_json::Error),
    /// Payload is not valid UTF-8
    Utf8(std::str::Utf8Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Json(e) => write!(f, "Invalid JSON payload: {}", e),
            DecodeError::Utf8(e) => write!(f, "Invalid UTF-8 payload: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError::Json(e)
    }
}

impl From<std::str::Utf8Error> for DecodeError {
    fn from(e: std::str::Utf8Error) -> Self {
        DecodeError::Utf8(e)
    }
}

/// Turns a raw payload into a value of type `T`
pub trait PayloadDecoder<T>: Send + Sync + 'static {
    fn decode(&self, payload: &[u8]) -> Result<T, DecodeError>;
}

/// Decodes JSON payloads with serde
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl<T: DeserializeOwned> PayloadDecoder<T> for JsonDecoder {
    fn decode(&self, payload: &[u8]) -> Result<T, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Passes payloads through as UTF-8 text
#[derive(Debug, Clone, Copy, Default)]
pub struct TextDecoder;

impl PayloadDecoder<String> for TextDecoder {
    fn decode(&self, payload: &[u8]) -> Result<String, DecodeError> {
        Ok(std::str::from_utf8(payload)?.to_string())
    }
}

/// Per-identity registrations on a single topic
pub struct TypedConsumer<T, D = JsonDecoder> {
    topic: String,
    multiplexer: Arc<SubscriptionMultiplexer>,
    decoder: Arc<D>,
    registrations: Mutex<HashMap<String, HandlerId>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedConsumer<T, JsonDecoder>
where
    T: DeserializeOwned + 'static,
{
    /// Consumer for `topic` decoding JSON payloads
    pub fn new(multiplexer: Arc<SubscriptionMultiplexer>, topic: impl Into<String>) -> Self {
        Self::with_decoder(multiplexer, topic, JsonDecoder)
    }
}

impl<T, D> TypedConsumer<T, D>
where
    T: 'static,
    D: PayloadDecoder<T>,
{
    pub fn with_decoder(
        multiplexer: Arc<SubscriptionMultiplexer>,
        topic: impl Into<String>,
        decoder: D,
    ) -> Self {
        Self {
            topic: topic.into(),
            multiplexer,
            decoder: Arc::new(decoder),
            registrations: Mutex::new(HashMap::new()),
            _marker: PhantomData,
        }
    }

    /// Register `handler` under `identity`.
    ///
    /// Returns false, keeping the existing handler, when the identity is
    /// already registered.
    pub fn subscribe<F>(&self, identity: &str, handler: F) -> bool
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let mut registrations = self.registrations.lock();
        if registrations.contains_key(identity) {
            debug!(
                "Consumer: '{}' already subscribed to '{}'",
                identity, self.topic
            );
            return false;
        }

        let topic = self.topic.clone();
        let owner = identity.to_string();
        let decoder = self.decoder.clone();
        let id = self.multiplexer.add_handler(
            &self.topic,
            move |message_topic: &str, payload: &Bytes, _meta: &MessageMeta| {
                if message_topic != topic {
                    return Ok(());
                }
                let value = decoder
                    .decode(payload)
                    .map_err(|error| HandlerError::Decode {
                        identity: owner.clone(),
                        error,
                    })?;
                handler(value);
                Ok(())
            },
        );

        registrations.insert(identity.to_string(), id);
        debug!("Consumer: '{}' subscribed to '{}'", identity, self.topic);
        true
    }
}

impl<T, D> TypedConsumer<T, D> {
    /// Remove the registration for `identity`. Unknown identities are ignored.
    pub fn unsubscribe(&self, identity: &str) -> bool {
        let Some(id) = self.registrations.lock().remove(identity) else {
            return false;
        };
        self.multiplexer.remove_handler(&self.topic, id);
        debug!("Consumer: '{}' unsubscribed from '{}'", identity, self.topic);
        true
    }

    pub fn is_subscribed(&self, identity: &str) -> bool {
        self.registrations.lock().contains_key(identity)
    }

    /// Number of registered identities
    pub fn len(&self) -> usize {
        self.registrations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.lock().is_empty()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn multiplexer(&self) -> &Arc<SubscriptionMultiplexer> {
        &self.multiplexer
    }
}

impl<T, D> Drop for TypedConsumer<T, D> {
    fn drop(&mut self) {
        for (_, id) in self.registrations.get_mut().drain() {
            self.multiplexer.remove_handler(&self.topic, id);
        }
    }
}
