/*!
In-memory message bus for development without a broker.

Mirrors the bus shim surface used by the coordinator: subscribe a handler
on a topic pattern, publish bytes on a topic. Every published message is
recorded so tests can assert on what went over the wire, and delivery is
synchronous so assertions can run immediately after a publish.
*/

use std::sync::{Arc, Mutex};

/// A message captured by the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

type Handler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// In-process pub/sub bus with MQTT-style wildcard matching.
#[derive(Clone, Default)]
pub struct MemoryBus {
    subscriptions: Arc<Mutex<Vec<(String, Handler)>>>,
    published: Arc<Mutex<Vec<BusMessage>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a topic pattern (`+` and `#` wildcards).
    pub fn subscribe<F>(&self, pattern: &str, handler: F)
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.subscriptions
            .lock()
            .unwrap()
            .push((pattern.to_string(), Arc::new(handler)));
        log::info!("[stub] subscribed to {}", pattern);
    }

    /// Publish a message and deliver it synchronously to matching handlers.
    ///
    /// Handlers may publish from within their callback (an agent handler
    /// publishing a result, say); the subscription lock is released before
    /// any handler runs.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let payload = payload.into();
        self.published.lock().unwrap().push(BusMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
        });
        log::info!("[stub] published {} bytes to {}", payload.len(), topic);

        let matching: Vec<Handler> = self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|(pattern, _)| topic_matches(pattern, topic))
            .map(|(_, h)| h.clone())
            .collect();

        for handler in matching {
            handler(topic, &payload);
        }
    }

    /// All messages published so far, in order.
    pub fn published(&self) -> Vec<BusMessage> {
        self.published.lock().unwrap().clone()
    }

    /// Messages published on one exact topic.
    pub fn published_on(&self, topic: &str) -> Vec<BusMessage> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Patterns currently subscribed (for assertions).
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn clear_published(&self) {
        self.published.lock().unwrap().clear();
    }
}

/// MQTT topic filter matching: `+` matches one level, a trailing `#`
/// matches the rest.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
