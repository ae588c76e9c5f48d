use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::PublishError;
use crate::producer::send_queue::BoundedSendQueue;
use crate::transport::BrokerTransport;

/// Background drain loop for one non-blocking producer.
///
/// Publishes the queue head and removes it only on success, so the FIFO
/// order of enqueued messages is the publish order. The first publish
/// failure is recorded and halts the loop; the queue's remaining contents
/// stay untouched until `stop`. No retries.
pub(crate) struct BackgroundPublisher {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl BackgroundPublisher {
    pub fn spawn(
        transport: Arc<dyn BrokerTransport>,
        queue: Arc<BoundedSendQueue>,
        idle_wait: Duration,
        error: Arc<OnceLock<PublishError>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_drain_loop(
            transport,
            queue,
            idle_wait,
            error,
            cancel.clone(),
        ));
        Self { handle, cancel }
    }

    /// Cancel the loop and wait for it to exit. Does not flush the queue.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!("background publisher task panicked: {e}");
        }
    }
}

async fn run_drain_loop(
    transport: Arc<dyn BrokerTransport>,
    queue: Arc<BoundedSendQueue>,
    idle_wait: Duration,
    error: Arc<OnceLock<PublishError>>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let Some(msg) = queue.peek_front() else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(idle_wait) => {}
            }
            continue;
        };

        match transport
            .publish(&msg.topic, msg.payload.clone(), &msg.headers)
            .await
        {
            Ok(ack) => {
                queue.pop_front();
                debug!(topic = %msg.topic, sequence = ack.sequence, "published queued message");
            }
            Err(source) => {
                let failure = PublishError {
                    topic: msg.topic,
                    source,
                };
                error!(queued = queue.len(), "halting background publisher: {failure}");
                error.set(failure).ok();
                cancel.cancel();
                break;
            }
        }
    }
}
