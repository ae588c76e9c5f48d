//! Entry point: builds producers and consumers on top of a broker
//! connection, going through broker-side registration first.

use std::sync::{Arc, OnceLock};

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{ClientOptions, ConsumerOptions, ProducerOptions};
use crate::consumer::keepalive::KeepAliveHeartbeat;
use crate::consumer::subscription::PartitionSubscription;
use crate::consumer::{BatchConsumer, CallbackConsumer};
use crate::error::{ConsumerError, ConsumerSetupError, RegistrationError, SubscribeError};
use crate::message::ConsumedMessage;
use crate::producer::Producer;
use crate::transport::{BrokerTransport, TransportError};

/// Handle to one broker connection, from which producers and consumers are
/// built.
///
/// Construction of either first registers it with the broker; the partition
/// set that comes back is fixed for the object's lifetime. A registration or
/// subscription failure means no object is handed out at all.
pub struct StationClient {
    transport: Arc<dyn BrokerTransport>,
    options: ClientOptions,
    connection_id: String,
}

impl StationClient {
    pub fn new(transport: Arc<dyn BrokerTransport>, options: ClientOptions) -> Self {
        let connection_id = format!("{}::{}", Uuid::new_v4(), options.username);
        info!(connection_id = %connection_id, "station client ready");
        Self {
            transport,
            options,
            connection_id,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub async fn create_producer(
        &self,
        options: ProducerOptions,
    ) -> Result<Producer, RegistrationError> {
        let partitions = self
            .transport
            .register_producer(
                &options.station_name,
                &options.producer_name,
                &self.connection_id,
            )
            .await
            .map_err(|source| RegistrationError {
                station: options.station_name.clone(),
                source,
            })?;
        let partitions = non_empty(partitions, &options.station_name)?;
        debug!(
            station = %options.station_name,
            producer = %options.producer_name,
            partitions = partitions.len(),
            "registered producer"
        );
        Ok(Producer::new(
            self.transport.clone(),
            options,
            partitions,
            self.connection_id.clone(),
            &self.options,
        ))
    }

    pub async fn create_batch_consumer(
        &self,
        options: ConsumerOptions,
    ) -> Result<BatchConsumer, ConsumerSetupError> {
        let group = options.durable_group();
        let partitions = self.register_consumer(&options, &group).await?;
        let subscriptions = self
            .subscribe_all(&options.station_name, &group, &partitions)
            .await?;
        let error = Arc::new(OnceLock::new());
        let heartbeats = self.spawn_heartbeats(&subscriptions, &group, &error);
        Ok(BatchConsumer::new(
            options.station_name,
            group,
            subscriptions,
            heartbeats,
            self.options.batch_size,
            self.options.max_wait(),
            error,
        ))
    }

    pub async fn create_callback_consumer(
        &self,
        options: ConsumerOptions,
        callback: impl Fn(Vec<ConsumedMessage>) + Send + Sync + 'static,
    ) -> Result<CallbackConsumer, ConsumerSetupError> {
        let group = options.durable_group();
        let partitions = self.register_consumer(&options, &group).await?;
        let subscriptions = self
            .subscribe_all(&options.station_name, &group, &partitions)
            .await?;
        let error: Arc<OnceLock<ConsumerError>> = Arc::new(OnceLock::new());
        let workers = subscriptions
            .into_iter()
            .map(|subscription| {
                let subscription = Arc::new(subscription);
                let heartbeat = KeepAliveHeartbeat::spawn(
                    self.transport.clone(),
                    subscription.stream().to_string(),
                    group.clone(),
                    subscription.partition(),
                    self.options.heartbeat_interval(),
                    error.clone(),
                );
                (subscription, heartbeat)
            })
            .collect();
        Ok(CallbackConsumer::new(
            options.station_name,
            group,
            workers,
            self.options.batch_size,
            self.options.max_wait(),
            self.options.pull_interval(),
            Arc::new(callback),
            error,
        ))
    }

    async fn register_consumer(
        &self,
        options: &ConsumerOptions,
        group: &str,
    ) -> Result<Vec<u32>, RegistrationError> {
        let partitions = self
            .transport
            .register_consumer(
                &options.station_name,
                group,
                &options.consumer_name,
                &self.connection_id,
                options.start_policy,
            )
            .await
            .map_err(|source| RegistrationError {
                station: options.station_name.clone(),
                source,
            })?;
        let partitions = non_empty(partitions, &options.station_name)?;
        debug!(
            station = %options.station_name,
            consumer = %options.consumer_name,
            group = %group,
            partitions = partitions.len(),
            "registered consumer"
        );
        Ok(partitions)
    }

    /// Subscribe every partition up front. On any failure the partitions
    /// already subscribed are released again, so the caller never ends up
    /// with a half-built consumer.
    async fn subscribe_all(
        &self,
        station: &str,
        group: &str,
        partitions: &[u32],
    ) -> Result<Vec<PartitionSubscription>, SubscribeError> {
        let mut subscriptions = Vec::with_capacity(partitions.len());
        for &partition in partitions {
            match PartitionSubscription::subscribe(self.transport.clone(), station, partition, group)
                .await
            {
                Ok(subscription) => subscriptions.push(subscription),
                Err(failure) => {
                    for subscription in &subscriptions {
                        subscription.unsubscribe().await;
                    }
                    return Err(failure);
                }
            }
        }
        Ok(subscriptions)
    }

    fn spawn_heartbeats(
        &self,
        subscriptions: &[PartitionSubscription],
        group: &str,
        error: &Arc<OnceLock<ConsumerError>>,
    ) -> Vec<KeepAliveHeartbeat> {
        subscriptions
            .iter()
            .map(|subscription| {
                KeepAliveHeartbeat::spawn(
                    self.transport.clone(),
                    subscription.stream().to_string(),
                    group.to_string(),
                    subscription.partition(),
                    self.options.heartbeat_interval(),
                    error.clone(),
                )
            })
            .collect()
    }
}

fn non_empty(partitions: Vec<u32>, station: &str) -> Result<Vec<u32>, RegistrationError> {
    if partitions.is_empty() {
        return Err(RegistrationError {
            station: station.to_string(),
            source: TransportError::Rejected("no partitions assigned".to_string()),
        });
    }
    Ok(partitions)
}
