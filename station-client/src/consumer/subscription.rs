use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{FetchError, SubscribeError};
use crate::message::ConsumedMessage;
use crate::naming;
use crate::transport::{BrokerTransport, SubscriptionHandle};

/// One partition's pull subscription: the unit of fetch and unsubscribe.
pub(crate) struct PartitionSubscription {
    transport: Arc<dyn BrokerTransport>,
    partition: u32,
    stream: String,
    group: String,
    handle: SubscriptionHandle,
}

impl PartitionSubscription {
    pub async fn subscribe(
        transport: Arc<dyn BrokerTransport>,
        station: &str,
        partition: u32,
        group: &str,
    ) -> Result<Self, SubscribeError> {
        let topic = naming::partition_topic(station, partition);
        let handle = transport
            .subscribe(&topic, group)
            .await
            .map_err(|source| SubscribeError {
                station: station.to_string(),
                partition,
                source,
            })?;
        debug!(partition, topic = %topic, group = %group, "subscribed partition");
        Ok(Self {
            transport,
            partition,
            stream: naming::partition_stream(station, partition),
            group: group.to_string(),
            handle,
        })
    }

    /// Up to `batch_size` messages, blocking at most `max_wait`.
    pub async fn fetch(
        &self,
        batch_size: usize,
        max_wait: Duration,
    ) -> Result<Vec<ConsumedMessage>, FetchError> {
        let raw = self
            .transport
            .fetch(&self.handle, batch_size, max_wait)
            .await
            .map_err(|source| FetchError {
                partition: self.partition,
                source,
            })?;
        Ok(raw
            .into_iter()
            .map(|m| ConsumedMessage::new(m.payload, self.group.clone()))
            .collect())
    }

    /// Release the broker-side subscription. Failures are logged, not
    /// propagated; teardown keeps going regardless.
    pub async fn unsubscribe(&self) {
        if let Err(e) = self.transport.unsubscribe(&self.handle).await {
            warn!(partition = self.partition, "failed to unsubscribe partition: {e}");
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Stream name the broker's consumer-metadata calls use for this
    /// partition.
    pub fn stream(&self) -> &str {
        &self.stream
    }
}
