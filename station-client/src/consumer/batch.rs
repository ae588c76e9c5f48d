use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::info;

use crate::consumer::keepalive::KeepAliveHeartbeat;
use crate::consumer::subscription::PartitionSubscription;
use crate::error::{ConsumerError, FetchError};
use crate::message::ConsumedMessage;

/// Synchronous pull consumer over every partition of one station.
///
/// Each `fetch` call is independent: partitions are polled one after the
/// other in partition-set order and their batches concatenated, so one call
/// can take up to `partitions * max_wait` in the worst case. That trade-off
/// buys deterministic, non-interleaved output.
pub struct BatchConsumer {
    station_name: String,
    group: String,
    subscriptions: Vec<PartitionSubscription>,
    heartbeats: Vec<KeepAliveHeartbeat>,
    batch_size: usize,
    max_wait: Duration,
    error: Arc<OnceLock<ConsumerError>>,
}

impl BatchConsumer {
    pub(crate) fn new(
        station_name: String,
        group: String,
        subscriptions: Vec<PartitionSubscription>,
        heartbeats: Vec<KeepAliveHeartbeat>,
        batch_size: usize,
        max_wait: Duration,
        error: Arc<OnceLock<ConsumerError>>,
    ) -> Self {
        Self {
            station_name,
            group,
            subscriptions,
            heartbeats,
            batch_size,
            max_wait,
            error,
        }
    }

    /// One batch per partition, concatenated in partition-set order.
    pub async fn fetch(&self) -> Result<Vec<ConsumedMessage>, FetchError> {
        let mut messages = Vec::new();
        for subscription in &self.subscriptions {
            messages.extend(subscription.fetch(self.batch_size, self.max_wait).await?);
        }
        Ok(messages)
    }

    /// First failure captured by a background heartbeat, if any.
    pub fn background_error(&self) -> Option<ConsumerError> {
        self.error.get().cloned()
    }

    pub fn partitions(&self) -> Vec<u32> {
        self.subscriptions.iter().map(|s| s.partition()).collect()
    }

    /// Cancel and join every heartbeat, then unsubscribe every partition.
    /// Returns only once no background task of this consumer is left.
    pub async fn destroy(self) {
        for heartbeat in &self.heartbeats {
            heartbeat.cancel();
        }
        for heartbeat in self.heartbeats {
            heartbeat.join().await;
        }
        for subscription in &self.subscriptions {
            subscription.unsubscribe().await;
        }
        info!(
            station = %self.station_name,
            group = %self.group,
            "batch consumer destroyed"
        );
    }
}
