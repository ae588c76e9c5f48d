use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::error::{ConsumerError, HeartbeatError};
use crate::transport::BrokerTransport;

/// Per-partition keep-alive loop.
///
/// Periodically issues a describe-consumer call so the broker does not evict
/// the durable group registration as idle. A transport failure is fatal to
/// this loop only: it is recorded and logged, and the sibling polling loop
/// and subscription stay untouched.
pub(crate) struct KeepAliveHeartbeat {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl KeepAliveHeartbeat {
    pub fn spawn(
        transport: Arc<dyn BrokerTransport>,
        stream: String,
        group: String,
        partition: u32,
        period: Duration,
        error: Arc<OnceLock<ConsumerError>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                if let Err(source) = transport.describe_consumer(&stream, &group).await {
                    let failure = HeartbeatError {
                        partition,
                        group: group.clone(),
                        source,
                    };
                    error!("heartbeat loop halted: {failure}");
                    error.set(ConsumerError::Heartbeat(failure)).ok();
                    break;
                }
                trace!(partition, group = %group, "keep-alive ping");
            }
        });
        Self { handle, cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!("heartbeat task panicked: {e}");
        }
    }
}
