//! Seam between the concurrency engine and the broker glue.
//!
//! Everything network-shaped (connection bootstrap, TLS, the pull-subscribe
//! mechanics, registration request encoding) implements this trait; the
//! engine only ever sees opaque handles and byte payloads.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::config::StartPolicy;

/// Transport-level failure surfaced by the broker glue.
///
/// Cloneable so background loops can capture the first failure and hand it
/// out later through their owner's error accessor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("broker rejected request: {0}")]
    Rejected(String),
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("broker request timed out after {0:?}")]
    Timeout(Duration),
}

/// Opaque identifier for one partition's pull subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Broker acknowledgment for one published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
}

/// Message as it comes off a partition, before the engine wraps it.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub payload: Bytes,
}

/// Broker-routing headers. Insertion order is preserved on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders(Vec<(String, String)>);

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}


/// Operations the engine needs from the broker connection.
///
/// `fetch` returns up to `batch_size` messages, blocking at most `max_wait`
/// before returning whatever arrived, including nothing. `describe_consumer`
/// is a lightweight metadata call used only to keep a durable group
/// registration from being evicted as idle.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn register_producer(
        &self,
        station: &str,
        producer: &str,
        connection_id: &str,
    ) -> Result<Vec<u32>, TransportError>;

    async fn register_consumer(
        &self,
        station: &str,
        group: &str,
        consumer: &str,
        connection_id: &str,
        start_policy: StartPolicy,
    ) -> Result<Vec<u32>, TransportError>;

    async fn subscribe(
        &self,
        topic: &str,
        durable_group: &str,
    ) -> Result<SubscriptionHandle, TransportError>;

    async fn fetch(
        &self,
        handle: &SubscriptionHandle,
        batch_size: usize,
        max_wait: Duration,
    ) -> Result<Vec<RawMessage>, TransportError>;

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), TransportError>;

    async fn describe_consumer(&self, stream: &str, group: &str) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        headers: &MessageHeaders,
    ) -> Result<PublishAck, TransportError>;
}
