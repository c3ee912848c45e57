//! The streaming bridge core.
//!
//! Two cooperating tasks share a bounded FIFO buffer: the ingest loop polls
//! the consumer, enriches payloads and appends at the tail; the publish loop
//! pops the head and forwards outbound. Offsets are committed only for
//! messages whose publish was acknowledged, one commit cycle per ingest
//! iteration, always `max(offset) + 1` per partition.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vigil_core::clock::SharedClock;
use vigil_core::config::BridgeConfig;

use crate::consumer::{BridgeConsumer, PolledMessage};
use crate::publisher::{PublishError, Publisher};

/// How long the publish loop gets to drain the buffer at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Sleep while paused or while the buffer is empty.
const IDLE_SLEEP: Duration = Duration::from_millis(100);
const EMPTY_BUFFER_SLEEP: Duration = Duration::from_millis(10);

/// A message waiting to be published.
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub partition: i32,
    pub offset: i64,
    pub source_timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

/// Counters for monitoring; snapshotted by the health endpoint.
#[derive(Debug, Clone, Default)]
pub struct BridgeMetricsSnapshot {
    pub messages_received: u64,
    pub messages_published: u64,
    pub messages_failed: u64,
    pub publish_errors: u64,
    pub buffer_high_water: usize,
    pub paused_count: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_publish_at: Option<DateTime<Utc>>,
}

/// Health report for the bridge process.
#[derive(Debug, Clone)]
pub struct BridgeHealth {
    pub healthy: bool,
    pub paused: bool,
    pub buffer_size: usize,
    pub buffer_max: usize,
    pub lag_seconds: Option<f64>,
    pub metrics: BridgeMetricsSnapshot,
}

/// Kafka to Pub/Sub bridge with backpressure handling.
pub struct StreamingBridge {
    config: BridgeConfig,
    consumer: Arc<dyn BridgeConsumer>,
    publisher: Arc<dyn Publisher>,
    clock: SharedClock,

    buffer: Mutex<VecDeque<BufferedMessage>>,
    /// partition -> highest offset whose publish was acknowledged.
    uncommitted: Mutex<HashMap<i32, i64>>,
    paused: AtomicBool,
    metrics: Mutex<BridgeMetricsSnapshot>,
    shutdown: CancellationToken,
}

impl StreamingBridge {
    pub fn new(
        config: BridgeConfig,
        consumer: Arc<dyn BridgeConsumer>,
        publisher: Arc<dyn Publisher>,
        clock: SharedClock,
    ) -> Arc<StreamingBridge> {
        info!(
            kafka_topic = %config.kafka_topic,
            pubsub_topic = %config.pubsub_topic,
            buffer_max = config.buffer_max_size,
            "bridge initialised"
        );
        Arc::new(StreamingBridge {
            config,
            consumer,
            publisher,
            clock,
            buffer: Mutex::new(VecDeque::new()),
            uncommitted: Mutex::new(HashMap::new()),
            paused: AtomicBool::new(false),
            metrics: Mutex::new(BridgeMetricsSnapshot::default()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Token to wire into signal handlers.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Main loop. Returns after a graceful shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let publisher_stop = CancellationToken::new();
        let publish_task = tokio::spawn(self.clone().publish_loop(publisher_stop.clone()));

        info!(topic = %self.config.kafka_topic, "bridge started");
        while !self.shutdown.is_cancelled() {
            self.ingest_cycle().await;
            self.check_backpressure();
            self.commit_offsets();
        }

        // Graceful shutdown: stop polling, give the publish loop a bounded
        // window to drain, commit what was acknowledged, and exit. Whatever
        // stays in the buffer is re-read next start; its offsets were never
        // committed.
        info!("graceful shutdown starting");
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if lock(&self.buffer).is_empty() {
                break;
            }
            tokio::time::sleep(IDLE_SLEEP).await;
        }

        let remaining = lock(&self.buffer).len();
        if remaining > 0 {
            warn!(count = remaining, "shutdown with messages remaining in buffer");
        }

        publisher_stop.cancel();
        let _ = publish_task.await;
        self.commit_offsets();

        let snapshot = lock(&self.metrics).clone();
        info!(
            messages_received = snapshot.messages_received,
            messages_published = snapshot.messages_published,
            messages_failed = snapshot.messages_failed,
            "bridge shutdown complete"
        );
        Ok(())
    }

    async fn ingest_cycle(&self) {
        if self.paused.load(Ordering::SeqCst) {
            // While paused we must not poll; fetches would refill the buffer.
            tokio::time::sleep(IDLE_SLEEP).await;
            return;
        }

        match self.consumer.poll(Duration::from_secs(1)).await {
            Ok(None) => {}
            Ok(Some(message)) => self.ingest(message),
            Err(e) => {
                error!(error = %e, "kafka poll error");
                tokio::time::sleep(IDLE_SLEEP).await;
            }
        }
    }

    fn ingest(&self, message: PolledMessage) {
        let mut value: serde_json::Value = match serde_json::from_slice(&message.payload) {
            Ok(value) => value,
            Err(e) => {
                error!(offset = message.offset, error = %e, "message decode error");
                lock(&self.metrics).messages_failed += 1;
                counter!("bridge.messages_failed", 1);
                return;
            }
        };
        let Some(object) = value.as_object_mut() else {
            error!(offset = message.offset, "message is not a JSON object");
            lock(&self.metrics).messages_failed += 1;
            counter!("bridge.messages_failed", 1);
            return;
        };

        let now = self.clock.now_utc();
        let source_timestamp = message.timestamp.unwrap_or(now);
        object.insert("_kafka_partition".into(), serde_json::json!(message.partition));
        object.insert("_kafka_offset".into(), serde_json::json!(message.offset));
        object.insert(
            "_kafka_timestamp".into(),
            serde_json::json!(source_timestamp.to_rfc3339()),
        );
        object.insert("_ingestion_time".into(), serde_json::json!(now.to_rfc3339()));

        let payload = value.to_string().into_bytes();
        let buffered = BufferedMessage {
            partition: message.partition,
            offset: message.offset,
            source_timestamp,
            received_at: now,
            payload,
        };

        {
            let mut buffer = lock(&self.buffer);
            buffer.push_back(buffered);
            let occupancy = buffer.len();
            let mut metrics = lock(&self.metrics);
            metrics.buffer_high_water = metrics.buffer_high_water.max(occupancy);
            metrics.messages_received += 1;
            metrics.last_message_at = Some(now);
        }
        counter!("bridge.messages_received", 1);
    }

    fn check_backpressure(&self) {
        let occupancy = lock(&self.buffer).len();
        let paused = self.paused.load(Ordering::SeqCst);

        if !paused && occupancy >= self.config.buffer_max_size {
            match self.consumer.pause() {
                Ok(()) => {
                    self.paused.store(true, Ordering::SeqCst);
                    let mut metrics = lock(&self.metrics);
                    metrics.paused_count += 1;
                    warn!(buffer_size = occupancy, "kafka consumer paused for backpressure");
                }
                Err(e) => error!(error = %e, "failed to pause consumer"),
            }
        } else if paused && occupancy <= self.config.buffer_resume_size {
            match self.consumer.resume() {
                Ok(()) => {
                    self.paused.store(false, Ordering::SeqCst);
                    info!(buffer_size = occupancy, "kafka consumer resumed");
                }
                Err(e) => error!(error = %e, "failed to resume consumer"),
            }
        }
    }

    async fn publish_loop(self: Arc<Self>, stop: CancellationToken) {
        while !stop.is_cancelled() {
            let message = lock(&self.buffer).pop_front();
            let Some(message) = message else {
                tokio::time::sleep(EMPTY_BUFFER_SLEEP).await;
                continue;
            };

            match self.publisher.publish(&message.payload).await {
                Ok(()) => {
                    {
                        let mut uncommitted = lock(&self.uncommitted);
                        let entry = uncommitted.entry(message.partition).or_insert(message.offset);
                        *entry = (*entry).max(message.offset);
                    }
                    let mut metrics = lock(&self.metrics);
                    metrics.messages_published += 1;
                    metrics.last_publish_at = Some(self.clock.now_utc());
                    counter!("bridge.messages_published", 1);
                }
                Err(PublishError::Transient(e)) => {
                    warn!(
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "transient publish failure, re-queueing"
                    );
                    lock(&self.metrics).publish_errors += 1;
                    counter!("bridge.publish_errors", 1);
                    // Head, not tail: retries keep FIFO order.
                    lock(&self.buffer).push_front(message);
                    tokio::time::sleep(IDLE_SLEEP).await;
                }
                Err(PublishError::Fatal(e)) => {
                    error!(
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "publish failed permanently, dropping message"
                    );
                    lock(&self.metrics).messages_failed += 1;
                    counter!("bridge.messages_failed", 1);
                }
            }
        }
    }

    fn commit_offsets(&self) {
        let drained: Vec<(i32, i64)> = {
            let mut uncommitted = lock(&self.uncommitted);
            uncommitted
                .drain()
                // Committed offset is the next position to read.
                .map(|(partition, offset)| (partition, offset + 1))
                .collect()
        };
        if drained.is_empty() {
            return;
        }
        if let Err(e) = self.consumer.commit(&drained) {
            error!(error = %e, "kafka commit error");
        }
    }

    /// Health rule: not paused, ingest not stalled beyond the lag budget, and
    /// the buffer below 90% of its bound.
    pub fn health(&self) -> BridgeHealth {
        let buffer_size = lock(&self.buffer).len();
        let metrics = lock(&self.metrics).clone();
        let paused = self.paused.load(Ordering::SeqCst);

        let lag_seconds = metrics.last_message_at.map(|at| {
            (self.clock.now_utc() - at).num_milliseconds() as f64 / 1000.0
        });

        let healthy = !paused
            && lag_seconds.map_or(true, |lag| lag < self.config.max_lag_seconds as f64)
            && buffer_size < (self.config.buffer_max_size * 9) / 10;

        BridgeHealth {
            healthy,
            paused,
            buffer_size,
            buffer_max: self.config.buffer_max_size,
            lag_seconds,
            metrics,
        }
    }

    #[cfg(test)]
    fn buffer_len(&self) -> usize {
        lock(&self.buffer).len()
    }
}

/// Poison-tolerant lock: a panicked holder must not wedge the bridge.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use vigil_core::clock::SystemClock;

    use crate::BridgeError;

    fn test_config(buffer_max: usize, buffer_resume: usize) -> BridgeConfig {
        BridgeConfig {
            kafka_brokers: "localhost:9092".into(),
            kafka_topic: "trades".into(),
            kafka_group_id: "bridge-test".into(),
            pubsub_project: "surv-int".into(),
            pubsub_topic: "trades-out".into(),
            buffer_max_size: buffer_max,
            buffer_resume_size: buffer_resume,
            publish_batch_size: 100,
            publish_timeout_seconds: 1.0,
            max_lag_seconds: 300,
        }
    }

    #[derive(Default)]
    struct MockConsumer {
        queue: Mutex<VecDeque<PolledMessage>>,
        paused: AtomicBool,
        committed: Mutex<Vec<(i32, i64)>>,
    }

    impl MockConsumer {
        fn preload(&self, count: usize) {
            let mut queue = self.queue.lock().unwrap();
            for offset in 0..count as i64 {
                queue.push_back(PolledMessage {
                    partition: 0,
                    offset,
                    timestamp: Some(Utc::now()),
                    payload: format!("{{\"n\": {offset}}}").into_bytes(),
                });
            }
        }

        fn push_raw(&self, offset: i64, payload: &[u8]) {
            self.queue.lock().unwrap().push_back(PolledMessage {
                partition: 0,
                offset,
                timestamp: None,
                payload: payload.to_vec(),
            });
        }

        fn max_committed(&self) -> Option<i64> {
            self.committed.lock().unwrap().iter().map(|(_, o)| *o).max()
        }
    }

    #[async_trait]
    impl BridgeConsumer for MockConsumer {
        async fn poll(&self, _timeout: Duration) -> Result<Option<PolledMessage>, BridgeError> {
            let message = self.queue.lock().unwrap().pop_front();
            if message.is_none() {
                // Real Kafka consumers block for up to `timeout` when the
                // queue is empty; yield so the test runtime can schedule
                // the publish/shutdown tasks instead of busy-polling.
                tokio::task::yield_now().await;
            }
            Ok(message)
        }

        fn pause(&self) -> Result<(), BridgeError> {
            self.paused.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn resume(&self) -> Result<(), BridgeError> {
            self.paused.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn commit(&self, offsets: &[(i32, i64)]) -> Result<(), BridgeError> {
            self.committed.lock().unwrap().extend_from_slice(offsets);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockPublisher {
        stalled: AtomicBool,
        transient_failures: AtomicUsize,
        published: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Publisher for MockPublisher {
        async fn publish(&self, payload: &[u8]) -> Result<(), PublishError> {
            while self.stalled.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            let failures = self.transient_failures.load(Ordering::SeqCst);
            if failures > 0 {
                self.transient_failures.store(failures - 1, Ordering::SeqCst);
                return Err(PublishError::Transient("injected".into()));
            }
            self.published.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    fn bridge(
        config: BridgeConfig,
        consumer: Arc<MockConsumer>,
        publisher: Arc<MockPublisher>,
    ) -> Arc<StreamingBridge> {
        StreamingBridge::new(config, consumer, publisher, Arc::new(SystemClock))
    }

    async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !cond() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn backpressure_pauses_at_max_and_resumes_at_threshold() {
        let consumer = Arc::new(MockConsumer::default());
        let publisher = Arc::new(MockPublisher::default());
        consumer.preload(200);
        publisher.stalled.store(true, Ordering::SeqCst);

        let bridge = bridge(test_config(100, 50), consumer.clone(), publisher.clone());
        let handle = tokio::spawn(bridge.clone().run());

        // The consumer pauses exactly when occupancy reaches the bound.
        wait_for("pause", || consumer.paused.load(Ordering::SeqCst)).await;
        assert_eq!(bridge.buffer_len(), 100);
        assert!(!bridge.health().healthy);

        // Release the publisher; the buffer drains to the resume threshold
        // and consumption restarts.
        publisher.stalled.store(false, Ordering::SeqCst);
        wait_for("resume", || !consumer.paused.load(Ordering::SeqCst)).await;
        assert!(bridge.buffer_len() <= 50);

        // Everything eventually flows through.
        wait_for("all published", || {
            publisher.published.lock().unwrap().len() == 200
        })
        .await;

        bridge.shutdown_token().cancel();
        handle.await.unwrap().unwrap();

        // Offsets commit as max published + 1.
        assert_eq!(consumer.max_committed(), Some(200));
    }

    #[tokio::test]
    async fn transient_failures_retry_in_order() {
        let consumer = Arc::new(MockConsumer::default());
        let publisher = Arc::new(MockPublisher::default());
        consumer.preload(3);
        publisher.transient_failures.store(2, Ordering::SeqCst);

        let bridge = bridge(test_config(100, 50), consumer.clone(), publisher.clone());
        let handle = tokio::spawn(bridge.clone().run());

        wait_for("publishes", || {
            publisher.published.lock().unwrap().len() == 3
        })
        .await;
        bridge.shutdown_token().cancel();
        handle.await.unwrap().unwrap();

        let published = publisher.published.lock().unwrap();
        let offsets: Vec<i64> = published
            .iter()
            .map(|p| {
                serde_json::from_slice::<serde_json::Value>(p).unwrap()["_kafka_offset"]
                    .as_i64()
                    .unwrap()
            })
            .collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(bridge.health().metrics.publish_errors, 2);
    }

    #[tokio::test]
    async fn decode_failures_drop_and_never_commit() {
        let consumer = Arc::new(MockConsumer::default());
        let publisher = Arc::new(MockPublisher::default());
        consumer.push_raw(0, b"not json");

        let bridge = bridge(test_config(100, 50), consumer.clone(), publisher.clone());
        let handle = tokio::spawn(bridge.clone().run());

        wait_for("drop", || bridge.health().metrics.messages_failed == 1).await;
        bridge.shutdown_token().cancel();
        handle.await.unwrap().unwrap();

        assert!(publisher.published.lock().unwrap().is_empty());
        assert!(consumer.max_committed().is_none());
    }

    #[tokio::test]
    async fn payloads_are_enriched_with_provenance() {
        let consumer = Arc::new(MockConsumer::default());
        let publisher = Arc::new(MockPublisher::default());
        consumer.preload(1);

        let bridge = bridge(test_config(100, 50), consumer.clone(), publisher.clone());
        let handle = tokio::spawn(bridge.clone().run());
        wait_for("publish", || publisher.published.lock().unwrap().len() == 1).await;
        bridge.shutdown_token().cancel();
        handle.await.unwrap().unwrap();

        let published = publisher.published.lock().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(value["n"], 0);
        assert_eq!(value["_kafka_partition"], 0);
        assert_eq!(value["_kafka_offset"], 0);
        assert!(value["_kafka_timestamp"].is_string());
        assert!(value["_ingestion_time"].is_string());
    }

    #[tokio::test]
    async fn health_degrades_near_buffer_bound() {
        let consumer = Arc::new(MockConsumer::default());
        let publisher = Arc::new(MockPublisher::default());
        publisher.stalled.store(true, Ordering::SeqCst);
        consumer.preload(10);

        let bridge = bridge(test_config(10, 5), consumer.clone(), publisher.clone());
        let handle = tokio::spawn(bridge.clone().run());

        wait_for("fill", || bridge.buffer_len() >= 9).await;
        assert!(!bridge.health().healthy);

        publisher.stalled.store(false, Ordering::SeqCst);
        wait_for("drain", || bridge.buffer_len() == 0).await;
        assert!(bridge.health().healthy);

        bridge.shutdown_token().cancel();
        handle.await.unwrap().unwrap();
    }
}
