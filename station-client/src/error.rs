//! Error types, one per failure domain.
//!
//! Synchronous paths return these directly. Background loops (publisher,
//! heartbeats, partition polls) have no caller to return through, so they
//! capture their first failure into a shared slot exposed by the owning
//! producer/consumer and then halt; only the affected loop stops.

use thiserror::Error;

use crate::transport::TransportError;

/// The broker refused to register a producer or consumer. Fatal: the object
/// is never constructed.
#[derive(Debug, Clone, Error)]
#[error("broker rejected registration for station '{station}': {source}")]
pub struct RegistrationError {
    pub station: String,
    #[source]
    pub source: TransportError,
}

/// Subscribing one partition failed during consumer construction. Fatal to
/// the whole consumer; partitions already subscribed are rolled back.
#[derive(Debug, Clone, Error)]
#[error("failed to subscribe partition {partition} of station '{station}': {source}")]
pub struct SubscribeError {
    pub station: String,
    pub partition: u32,
    #[source]
    pub source: TransportError,
}

/// A single publish failed. Surfaced directly by `produce`; in the
/// background path it halts the publisher loop and freezes the queue.
#[derive(Debug, Clone, Error)]
#[error("failed to publish to '{topic}': {source}")]
pub struct PublishError {
    pub topic: String,
    #[source]
    pub source: TransportError,
}

/// Fetching from one partition failed.
#[derive(Debug, Clone, Error)]
#[error("failed to fetch from partition {partition}: {source}")]
pub struct FetchError {
    pub partition: u32,
    #[source]
    pub source: TransportError,
}

/// A keep-alive ping failed. Fatal to that heartbeat loop only; the sibling
/// polling loop and the subscription itself keep running.
#[derive(Debug, Clone, Error)]
#[error("keep-alive for partition {partition} of group '{group}' failed: {source}")]
pub struct HeartbeatError {
    pub partition: u32,
    pub group: String,
    #[source]
    pub source: TransportError,
}

/// Consumer construction failure: either the registration call or one of the
/// per-partition subscriptions.
#[derive(Debug, Clone, Error)]
pub enum ConsumerSetupError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
}

/// First failure captured by any of a consumer's background loops.
#[derive(Debug, Clone, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Heartbeat(#[from] HeartbeatError),
}
