//! Broker transports used by async actors.
//!
//! Actors only need to send one message and receive one message at a time, so
//! the transport surface is deliberately small. The bundled [`MemoryBroker`]
//! keeps named FIFO queues in memory; real brokers are plugged in by the
//! embedding application under their service type name.

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// One message on a queue or topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BrokerMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub value: String,
    pub headers: HashMap<String, String>,
    /// Broker-specific properties (delivery mode, partition, ...)
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, Value>,
}

impl BrokerMessage {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Send/receive capability for one broker type.
///
/// `receive` must be cancel-safe: dropping the future before it resolves must
/// not lose a message.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn send(&self, queue: &str, message: BrokerMessage) -> Result<()>;

    /// Wait up to `timeout` for the next message. `Ok(None)` on timeout.
    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<BrokerMessage>>;
}

/// In-process broker with named FIFO queues.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<BrokerMessage>>>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting on `queue`.
    pub async fn depth(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Remove and return every message waiting on `queue`.
    pub async fn drain(&self, queue: &str) -> Vec<BrokerMessage> {
        self.queues
            .lock()
            .await
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    async fn pop(&self, queue: &str) -> Option<BrokerMessage> {
        self.queues
            .lock()
            .await
            .get_mut(queue)
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn send(&self, queue: &str, message: BrokerMessage) -> Result<()> {
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .push_back(message);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<BrokerMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Created before the queue check so a concurrent send is never missed.
            let notified = self.notify.notified();
            if let Some(message) = self.pop(queue).await {
                return Ok(Some(message));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}
