use std::time::Duration;

use envconfig::Envconfig;

/// Connection-wide tuning shared by every producer and consumer built from
/// one [`StationClient`](crate::StationClient).
#[derive(Envconfig, Clone, Debug)]
pub struct ClientOptions {
    #[envconfig(from = "STATION_USERNAME", default = "root")]
    pub username: String,

    /// Maximum messages per partition fetch.
    #[envconfig(from = "STATION_BATCH_SIZE", default = "10")]
    pub batch_size: usize,

    /// Upper bound on how long one partition fetch blocks waiting for
    /// messages.
    #[envconfig(from = "STATION_MAX_WAIT_MS", default = "5000")]
    pub max_wait_ms: u64,

    /// Pause between callback-consumer polls of one partition.
    #[envconfig(from = "STATION_PULL_INTERVAL_MS", default = "1000")]
    pub pull_interval_ms: u64,

    /// Period of the per-partition keep-alive pings that stop the broker
    /// from evicting an idle durable group.
    #[envconfig(from = "STATION_HEARTBEAT_INTERVAL_MS", default = "10000")]
    pub heartbeat_interval_ms: u64,

    /// Capacity of the non-blocking producer's send queue. Once full,
    /// enqueues block until the background publisher drains it to half.
    #[envconfig(from = "STATION_SEND_QUEUE_CAPACITY", default = "1000")]
    pub send_queue_capacity: usize,

    /// How long the background publisher sleeps when its queue is empty.
    #[envconfig(from = "STATION_PUBLISHER_IDLE_WAIT_MS", default = "10")]
    pub publisher_idle_wait_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            batch_size: 10,
            max_wait_ms: 5000,
            pull_interval_ms: 1000,
            heartbeat_interval_ms: 10_000,
            send_queue_capacity: 1000,
            publisher_idle_wait_ms: 10,
        }
    }
}

impl ClientOptions {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_millis(self.pull_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn publisher_idle_wait(&self) -> Duration {
        Duration::from_millis(self.publisher_idle_wait_ms)
    }
}

/// Identity of one producer on one station.
#[derive(Clone, Debug)]
pub struct ProducerOptions {
    pub station_name: String,
    pub producer_name: String,
}

/// Where a newly registered durable group starts reading. The variants are
/// mutually exclusive by construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartPolicy {
    /// From the first message still in the station.
    #[default]
    Beginning,
    /// From an absolute station sequence number.
    FromSequence(u64),
    /// Only the most recent `n` messages.
    LastMessages(u64),
}

/// Identity of one consumer on one station.
#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    pub station_name: String,
    pub consumer_name: String,
    /// Durable group shared by every instance using the same name. Defaults
    /// to the consumer name when unset.
    pub consumer_group: Option<String>,
    pub start_policy: StartPolicy,
}

impl ConsumerOptions {
    /// Effective durable group name, lowercased to match the broker's
    /// internal naming.
    pub(crate) fn durable_group(&self) -> String {
        self.consumer_group
            .as_deref()
            .unwrap_or(&self.consumer_name)
            .to_lowercase()
    }
}
