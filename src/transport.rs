//! Pub/sub transport abstraction.
//!
//! The bridge only needs connect, subscribe, publish and disconnect plus a
//! stream of [`TransportEvent`]s. A broker client implements [`Transport`];
//! [`InMemoryTransport`] is a loopback used by tests and dry runs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Delivery guarantee requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(other),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("transport closed")]
    Closed,
}

/// Notifications emitted by the transport.
///
/// `Connected` is only emitted for reconnections the transport performs on
/// its own; a successful [`Transport::connect`] call is reported by its
/// return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    ConnectionLost(String),
    Reconnecting,
    Message { topic: String, payload: Vec<u8> },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), TransportError>;

    async fn disconnect(&self, grace: Duration) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Hand over the event stream. Returns `None` once it has been taken.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

impl PublishedMessage {
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.payload)
    }
}

struct Inner {
    connected: AtomicBool,
    connect_attempts: AtomicU32,
    connect_failures: AtomicU32,
    fail_publish: AtomicBool,
    connect_delay: Mutex<Duration>,
    publish_delay: Mutex<Duration>,
    failing_subscriptions: Mutex<HashSet<String>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    published: Mutex<Vec<PublishedMessage>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

/// Loopback transport that records everything published to it.
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                connected: AtomicBool::new(false),
                connect_attempts: AtomicU32::new(0),
                connect_failures: AtomicU32::new(0),
                fail_publish: AtomicBool::new(false),
                connect_delay: Mutex::new(Duration::ZERO),
                publish_delay: Mutex::new(Duration::ZERO),
                failing_subscriptions: Mutex::new(HashSet::new()),
                subscriptions: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.connect_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.inner.connect_delay.lock() = delay;
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        *self.inner.publish_delay.lock() = delay;
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscription(&self, topic: &str) {
        self.inner.failing_subscriptions.lock().insert(topic.to_string());
    }

    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.inner.subscriptions.lock().clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.published.lock().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear_published(&self) {
        self.inner.published.lock().clear();
    }

    /// Deliver an inbound message as if the broker had routed it to us.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.emit(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        });
    }

    /// Simulate the broker link dropping.
    pub fn drop_connection(&self, reason: &str) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.emit(TransportEvent::ConnectionLost(reason.to_string()));
    }

    /// Simulate the client's own reconnect loop succeeding.
    pub fn restore_connection(&self) {
        self.emit(TransportEvent::Reconnecting);
        self.inner.connected.store(true, Ordering::SeqCst);
        self.emit(TransportEvent::Connected);
    }

    fn emit(&self, event: TransportEvent) {
        // Nobody listening yet or any more; the event is dropped like a broker would.
        let _ = self.inner.events_tx.send(event);
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.inner.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.inner.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        if self.inner.failing_subscriptions.lock().contains(topic) {
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "not authorized".to_string(),
            });
        }
        self.inner.subscriptions.lock().push((topic.to_string(), qos));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }

        let delay = *self.inner.publish_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "broker rejected message".to_string(),
            });
        }

        self.inner.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }

    async fn disconnect(&self, _grace: Duration) -> Result<(), TransportError> {
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inner.events_rx.lock().take()
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
