use bytes::Bytes;

use crate::transport::MessageHeaders;

/// Fully formed outbound message. Built by the producing task, then handed
/// by value into the send queue; the background publisher is the only thing
/// that touches it afterwards.
#[derive(Debug, Clone)]
pub(crate) struct PendingMessage {
    pub topic: String,
    pub payload: Bytes,
    pub headers: MessageHeaders,
}

/// Message delivered to batch callers and consumer callbacks. Immutable once
/// created.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    payload: Bytes,
    consumer_group: String,
}

impl ConsumedMessage {
    pub(crate) fn new(payload: Bytes, consumer_group: String) -> Self {
        Self {
            payload,
            consumer_group,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Durable group this message was fetched under.
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }
}
