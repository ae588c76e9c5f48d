use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::consumer::keepalive::KeepAliveHeartbeat;
use crate::consumer::subscription::PartitionSubscription;
use crate::error::ConsumerError;
use crate::message::ConsumedMessage;

/// Handler invoked with each fetched batch.
///
/// Partitions poll independently, so the callback runs concurrently from
/// every partition's task and must be safe for that. It is invoked on the
/// polling task itself: a callback that blocks stalls that partition's
/// future polls, and nothing else. Empty batches are delivered too.
pub type BatchCallback = Arc<dyn Fn(Vec<ConsumedMessage>) + Send + Sync>;

struct PartitionWorker {
    subscription: Arc<PartitionSubscription>,
    poll: JoinHandle<()>,
    cancel: CancellationToken,
    heartbeat: KeepAliveHeartbeat,
}

/// Push-style consumer: one polling task and one heartbeat task per
/// partition (2N tasks for N partitions).
///
/// Partitions are independent streams; no ordering is guaranteed across
/// them. Within a partition, batches are delivered in fetch order.
pub struct CallbackConsumer {
    station_name: String,
    group: String,
    workers: Vec<PartitionWorker>,
    error: Arc<OnceLock<ConsumerError>>,
}

impl CallbackConsumer {
    pub(crate) fn new(
        station_name: String,
        group: String,
        subscriptions: Vec<(Arc<PartitionSubscription>, KeepAliveHeartbeat)>,
        batch_size: usize,
        max_wait: Duration,
        pull_interval: Duration,
        callback: BatchCallback,
        error: Arc<OnceLock<ConsumerError>>,
    ) -> Self {
        let workers = subscriptions
            .into_iter()
            .map(|(subscription, heartbeat)| {
                let cancel = CancellationToken::new();
                let poll = tokio::spawn(run_poll_loop(
                    subscription.clone(),
                    batch_size,
                    max_wait,
                    pull_interval,
                    callback.clone(),
                    error.clone(),
                    cancel.clone(),
                ));
                PartitionWorker {
                    subscription,
                    poll,
                    cancel,
                    heartbeat,
                }
            })
            .collect();
        Self {
            station_name,
            group,
            workers,
            error,
        }
    }

    /// First failure captured by a polling loop or heartbeat, if any.
    pub fn background_error(&self) -> Option<ConsumerError> {
        self.error.get().cloned()
    }

    pub fn partitions(&self) -> Vec<u32> {
        self.workers
            .iter()
            .map(|w| w.subscription.partition())
            .collect()
    }

    /// Cancel every polling loop and heartbeat, join the polling tasks, then
    /// unsubscribe every partition. Once this returns, no further callback
    /// invocation can occur.
    ///
    /// A poll loop that slipped past its cancellation check is still allowed
    /// to finish its fetch; subscriptions are only released once every poll
    /// task has exited, so no fetch ever hits a dead handle.
    pub async fn destroy(self) {
        for worker in &self.workers {
            worker.cancel.cancel();
            worker.heartbeat.cancel();
        }
        let mut stopped = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            let PartitionWorker {
                subscription,
                poll,
                heartbeat,
                ..
            } = worker;
            if let Err(e) = poll.await {
                error!("partition poll task panicked: {e}");
            }
            stopped.push((subscription, heartbeat));
        }
        for (subscription, heartbeat) in stopped {
            subscription.unsubscribe().await;
            heartbeat.join().await;
        }
        info!(
            station = %self.station_name,
            group = %self.group,
            "callback consumer destroyed"
        );
    }
}

async fn run_poll_loop(
    subscription: Arc<PartitionSubscription>,
    batch_size: usize,
    max_wait: Duration,
    pull_interval: Duration,
    callback: BatchCallback,
    error: Arc<OnceLock<ConsumerError>>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match subscription.fetch(batch_size, max_wait).await {
            Ok(batch) => callback(batch),
            Err(failure) => {
                error!(
                    partition = subscription.partition(),
                    "partition poll loop halted: {failure}"
                );
                error.set(ConsumerError::Fetch(failure)).ok();
                break;
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pull_interval) => {}
        }
    }
}
