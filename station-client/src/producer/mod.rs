//! Producer side: partition routing plus the optional non-blocking publish
//! pipeline.

mod publisher;
mod router;
mod send_queue;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use crate::config::{ClientOptions, ProducerOptions};
use crate::error::PublishError;
use crate::message::PendingMessage;
use crate::naming;
use crate::producer::publisher::BackgroundPublisher;
use crate::producer::router::PartitionRouter;
use crate::producer::send_queue::BoundedSendQueue;
use crate::transport::{BrokerTransport, MessageHeaders, PublishAck};

/// Header carrying the owning connection's identity, set on every publish.
pub const CONNECTION_ID_HEADER: &str = "$station_connectionId";
/// Header naming the producer a message came from, set on every publish.
pub const PRODUCED_BY_HEADER: &str = "$station_producedBy";

/// Publishes messages to one station, routing round-robin across its
/// partitions.
///
/// `produce` blocks for one network publish and surfaces failures to the
/// caller. `produce_nonblocking` hands the message to a bounded queue
/// drained by a background task; its failures halt that task and are only
/// visible through [`Producer::publish_error`]. One producer is built for a
/// single producing task; concurrent callers still get valid round-robin
/// routing but must share the producer behind their own synchronization.
pub struct Producer {
    transport: Arc<dyn BrokerTransport>,
    station_name: String,
    producer_name: String,
    connection_id: String,
    router: PartitionRouter,
    queue: Arc<BoundedSendQueue>,
    idle_wait: Duration,
    publisher: Option<BackgroundPublisher>,
    publish_error: Arc<OnceLock<PublishError>>,
}

impl Producer {
    pub(crate) fn new(
        transport: Arc<dyn BrokerTransport>,
        options: ProducerOptions,
        partitions: Vec<u32>,
        connection_id: String,
        client_options: &ClientOptions,
    ) -> Self {
        Self {
            transport,
            station_name: options.station_name,
            producer_name: options.producer_name,
            connection_id,
            router: PartitionRouter::new(partitions),
            queue: Arc::new(BoundedSendQueue::new(client_options.send_queue_capacity)),
            idle_wait: client_options.publisher_idle_wait(),
            publisher: None,
            publish_error: Arc::new(OnceLock::new()),
        }
    }

    /// Publish one message and wait for the broker acknowledgment.
    pub async fn produce(&self, payload: impl Into<Bytes>) -> Result<PublishAck, PublishError> {
        let msg = self.build_message(payload.into());
        self.transport
            .publish(&msg.topic, msg.payload, &msg.headers)
            .await
            .map_err(|source| PublishError {
                topic: msg.topic,
                source,
            })
    }

    /// Queue one message for the background publisher and return.
    ///
    /// Blocks only while the queue is at capacity, until the drain brings it
    /// down to half. The first call starts the background publisher.
    pub async fn produce_nonblocking(&mut self, payload: impl Into<Bytes>) {
        if self.publisher.is_none() {
            self.publisher = Some(BackgroundPublisher::spawn(
                self.transport.clone(),
                self.queue.clone(),
                self.idle_wait,
                self.publish_error.clone(),
            ));
            debug!(
                station = %self.station_name,
                producer = %self.producer_name,
                "started background publisher"
            );
        }
        let msg = self.build_message(payload.into());
        self.queue.enqueue(msg).await;
    }

    /// First failure recorded by the background publisher, if any. Once set,
    /// the queue is frozen and no further messages are drained.
    pub fn publish_error(&self) -> Option<PublishError> {
        self.publish_error.get().cloned()
    }

    /// Messages currently waiting in the send queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn partitions(&self) -> &[u32] {
        self.router.partitions()
    }

    /// Tear down the background publisher if one was started. Queued
    /// messages that were not yet published are abandoned.
    pub async fn stop(mut self) {
        if let Some(publisher) = self.publisher.take() {
            publisher.stop().await;
        }
        info!(
            station = %self.station_name,
            producer = %self.producer_name,
            abandoned = self.queue.len(),
            "producer stopped"
        );
    }

    // Routing headers go on before the topic is partition-qualified; the
    // broker attributes the message to this connection and producer.
    fn build_message(&self, payload: Bytes) -> PendingMessage {
        let mut headers = MessageHeaders::new();
        headers.insert(CONNECTION_ID_HEADER, &self.connection_id);
        headers.insert(PRODUCED_BY_HEADER, &self.producer_name);
        let partition = self.router.next();
        let topic = naming::partition_topic(&self.station_name, partition);
        PendingMessage {
            topic,
            payload,
            headers,
        }
    }
}
