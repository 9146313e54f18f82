//! In-memory transport for unit tests

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Transport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Subscribe(String),
    Unsubscribe(String),
    Disconnect,
}

/// Records every request and acknowledges it unless the topic is marked failing
#[derive(Default)]
pub(crate) struct MockTransport {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<String>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_topic(&self, topic: &str) {
        self.failing.lock().insert(topic.to_string());
    }

    pub(crate) fn heal_topic(&self, topic: &str) {
        self.failing.lock().remove(topic);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn subscribe_count(&self, topic: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Subscribe(t) if t == topic))
            .count()
    }

    pub(crate) fn unsubscribe_count(&self, topic: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Unsubscribe(t) if t == topic))
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.calls.lock().push(Call::Subscribe(topic.to_string()));
        if self.failing.lock().contains(topic) {
            return Err(TransportError::Rejected(format!("SUBACK failure for {}", topic)));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.calls.lock().push(Call::Unsubscribe(topic.to_string()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.calls.lock().push(Call::Disconnect);
        Ok(())
    }
}
