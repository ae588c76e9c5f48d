//! In-memory broker used by the integration tests: scriptable partition
//! assignments, seeded per-topic queues, and failure injection for publish,
//! subscribe, fetch, and describe calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use station_client::config::{ClientOptions, StartPolicy};
use station_client::transport::{
    BrokerTransport, MessageHeaders, PublishAck, RawMessage, SubscriptionHandle, TransportError,
};

#[derive(Debug, Clone)]
pub struct PublishedRecord {
    pub topic: String,
    pub payload: Bytes,
    pub headers: MessageHeaders,
}

#[derive(Default)]
struct BrokerState {
    stations: HashMap<String, Vec<u32>>,
    queues: HashMap<String, VecDeque<Bytes>>,
    published: Vec<PublishedRecord>,
    subscriptions: HashMap<u64, String>,
    next_handle: u64,
    describe_calls: HashMap<(String, String), usize>,
    unknown_fetches: usize,
    fail_publish_after: Option<usize>,
    failing_subscribes: HashSet<String>,
    failing_fetches: HashSet<String>,
    describe_failing: bool,
    reject_registrations: bool,
}

#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    publish_paused: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_station(self, station: &str, partitions: Vec<u32>) -> Self {
        self.lock().stations.insert(station.to_string(), partitions);
        self
    }

    pub fn seed(&self, topic: &str, payload: impl Into<Bytes>) {
        self.lock()
            .queues
            .entry(topic.to_string())
            .or_default()
            .push_back(payload.into());
    }

    pub fn published(&self) -> Vec<PublishedRecord> {
        self.lock().published.clone()
    }

    pub fn pause_publishing(&self) {
        self.publish_paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_publishing(&self) {
        self.publish_paused.store(false, Ordering::SeqCst);
    }

    /// Every publish after the first `n` successes fails.
    pub fn fail_publish_after(&self, n: usize) {
        self.lock().fail_publish_after = Some(n);
    }

    pub fn fail_subscribe(&self, topic: &str) {
        self.lock().failing_subscribes.insert(topic.to_string());
    }

    pub fn fail_fetch(&self, topic: &str) {
        self.lock().failing_fetches.insert(topic.to_string());
    }

    pub fn fail_describes(&self) {
        self.lock().describe_failing = true;
    }

    pub fn reject_registrations(&self) {
        self.lock().reject_registrations = true;
    }

    pub fn active_subscriptions(&self) -> usize {
        self.lock().subscriptions.len()
    }

    pub fn describe_count(&self, stream: &str, group: &str) -> usize {
        self.lock()
            .describe_calls
            .get(&(stream.to_string(), group.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_describe_count(&self) -> usize {
        self.lock().describe_calls.values().sum()
    }

    /// Fetch calls that arrived after their subscription was released.
    pub fn unknown_fetch_count(&self) -> usize {
        self.lock().unknown_fetches
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().expect("broker state lock poisoned")
    }

    fn assigned_partitions(&self, station: &str) -> Result<Vec<u32>, TransportError> {
        let state = self.lock();
        if state.reject_registrations {
            return Err(TransportError::Rejected("registration disabled".to_string()));
        }
        state
            .stations
            .get(station)
            .cloned()
            .ok_or_else(|| TransportError::Rejected(format!("unknown station '{station}'")))
    }

    fn drain(&self, topic: &str, batch_size: usize) -> Vec<RawMessage> {
        let mut state = self.lock();
        let queue = state.queues.entry(topic.to_string()).or_default();
        let take = batch_size.min(queue.len());
        queue
            .drain(..take)
            .map(|payload| RawMessage { payload })
            .collect()
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn register_producer(
        &self,
        station: &str,
        _producer: &str,
        _connection_id: &str,
    ) -> Result<Vec<u32>, TransportError> {
        self.assigned_partitions(station)
    }

    async fn register_consumer(
        &self,
        station: &str,
        _group: &str,
        _consumer: &str,
        _connection_id: &str,
        _start_policy: StartPolicy,
    ) -> Result<Vec<u32>, TransportError> {
        self.assigned_partitions(station)
    }

    async fn subscribe(
        &self,
        topic: &str,
        _durable_group: &str,
    ) -> Result<SubscriptionHandle, TransportError> {
        let mut state = self.lock();
        if state.failing_subscribes.contains(topic) {
            return Err(TransportError::Rejected(format!(
                "subscribe to '{topic}' refused"
            )));
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.subscriptions.insert(handle, topic.to_string());
        Ok(SubscriptionHandle(handle))
    }

    async fn fetch(
        &self,
        handle: &SubscriptionHandle,
        batch_size: usize,
        max_wait: Duration,
    ) -> Result<Vec<RawMessage>, TransportError> {
        let topic = {
            let mut state = self.lock();
            match state.subscriptions.get(&handle.0).cloned() {
                Some(topic) => topic,
                None => {
                    state.unknown_fetches += 1;
                    return Err(TransportError::Rejected(
                        "unknown subscription".to_string(),
                    ));
                }
            }
        };
        if self.lock().failing_fetches.contains(&topic) {
            return Err(TransportError::Connection(format!(
                "fetch from '{topic}' failed"
            )));
        }
        let batch = self.drain(&topic, batch_size);
        if !batch.is_empty() {
            return Ok(batch);
        }
        tokio::time::sleep(max_wait).await;
        Ok(self.drain(&topic, batch_size))
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), TransportError> {
        self.lock().subscriptions.remove(&handle.0);
        Ok(())
    }

    async fn describe_consumer(&self, stream: &str, group: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.describe_failing {
            return Err(TransportError::Connection(
                "consumer info unavailable".to_string(),
            ));
        }
        *state
            .describe_calls
            .entry((stream.to_string(), group.to_string()))
            .or_default() += 1;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        headers: &MessageHeaders,
    ) -> Result<PublishAck, TransportError> {
        while self.publish_paused.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let mut state = self.lock();
        if let Some(n) = state.fail_publish_after {
            if state.published.len() >= n {
                return Err(TransportError::Connection(
                    "injected publish failure".to_string(),
                ));
            }
        }
        state.published.push(PublishedRecord {
            topic: topic.to_string(),
            payload: payload.clone(),
            headers: headers.clone(),
        });
        let sequence = state.published.len() as u64;
        state
            .queues
            .entry(topic.to_string())
            .or_default()
            .push_back(payload);
        Ok(PublishAck {
            stream: topic.to_string(),
            sequence,
        })
    }
}

/// Polls `cond` every few milliseconds until it holds or `timeout` elapses.
pub async fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Installs a fmt subscriber once, so `RUST_LOG` controls test output.
fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// Client options tightened for test time scales.
pub fn fast_options() -> ClientOptions {
    init_test_logging();
    ClientOptions {
        batch_size: 10,
        max_wait_ms: 20,
        pull_interval_ms: 20,
        heartbeat_interval_ms: 20,
        send_queue_capacity: 10,
        publisher_idle_wait_ms: 2,
        ..ClientOptions::default()
    }
}
