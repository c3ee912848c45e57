//! Consumer seam.
//!
//! The bridge drives a narrow consumer contract so the core loop can be tested
//! without a broker: poll one message, pause or resume the assigned
//! partitions, and synchronously commit offsets. The Kafka implementation
//! wraps an `rdkafka` `BaseConsumer` with auto-commit disabled; polling runs
//! on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use tracing::debug;

use vigil_core::config::BridgeConfig;

use crate::BridgeError;

/// One message taken off the inbound topic.
#[derive(Debug, Clone)]
pub struct PolledMessage {
    pub partition: i32,
    pub offset: i64,
    /// Source timestamp if the broker carried one.
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: Vec<u8>,
}

/// The consumer operations the bridge needs.
#[async_trait]
pub trait BridgeConsumer: Send + Sync {
    /// Poll for one message. `None` on timeout.
    async fn poll(&self, timeout: Duration) -> Result<Option<PolledMessage>, BridgeError>;

    /// Pause fetching on all assigned partitions.
    fn pause(&self) -> Result<(), BridgeError>;

    /// Resume fetching on all assigned partitions.
    fn resume(&self) -> Result<(), BridgeError>;

    /// Synchronously commit `(partition, offset)` pairs. Offsets are the next
    /// position to read, i.e. last published offset + 1.
    fn commit(&self, offsets: &[(i32, i64)]) -> Result<(), BridgeError>;
}

/// Kafka-backed consumer bound to a single topic.
pub struct KafkaBridgeConsumer {
    consumer: Arc<BaseConsumer>,
    topic: String,
}

impl KafkaBridgeConsumer {
    pub fn new(config: &BridgeConfig) -> Result<KafkaBridgeConsumer, BridgeError> {
        let consumer: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.kafka_brokers)
            .set("group.id", &config.kafka_group_id)
            .set("auto.offset.reset", "earliest")
            // Offsets are committed manually after the Pub/Sub ack.
            .set("enable.auto.commit", "false")
            .set("max.poll.interval.ms", "300000")
            .create()
            .map_err(kafka_err)?;
        consumer
            .subscribe(&[&config.kafka_topic])
            .map_err(kafka_err)?;

        Ok(KafkaBridgeConsumer {
            consumer: Arc::new(consumer),
            topic: config.kafka_topic.clone(),
        })
    }
}

#[async_trait]
impl BridgeConsumer for KafkaBridgeConsumer {
    async fn poll(&self, timeout: Duration) -> Result<Option<PolledMessage>, BridgeError> {
        let consumer = self.consumer.clone();
        let polled = tokio::task::spawn_blocking(move || {
            consumer.poll(timeout).map(|result| {
                result.map(|message| PolledMessage {
                    partition: message.partition(),
                    offset: message.offset(),
                    timestamp: message
                        .timestamp()
                        .to_millis()
                        .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
                    payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                })
            })
        })
        .await
        .map_err(|e| BridgeError::Kafka(format!("poll task failed: {e}")))?;

        match polled {
            None => Ok(None),
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(KafkaError::PartitionEOF(partition))) => {
                debug!(partition, "partition EOF");
                Ok(None)
            }
            Some(Err(e)) => Err(kafka_err(e)),
        }
    }

    fn pause(&self) -> Result<(), BridgeError> {
        let assignment = self.consumer.assignment().map_err(kafka_err)?;
        self.consumer.pause(&assignment).map_err(kafka_err)
    }

    fn resume(&self) -> Result<(), BridgeError> {
        let assignment = self.consumer.assignment().map_err(kafka_err)?;
        self.consumer.resume(&assignment).map_err(kafka_err)
    }

    fn commit(&self, offsets: &[(i32, i64)]) -> Result<(), BridgeError> {
        let mut list = TopicPartitionList::new();
        for (partition, offset) in offsets {
            list.add_partition_offset(&self.topic, *partition, Offset::Offset(*offset))
                .map_err(kafka_err)?;
        }
        self.consumer
            .commit(&list, rdkafka::consumer::CommitMode::Sync)
            .map_err(kafka_err)
    }
}

fn kafka_err(e: KafkaError) -> BridgeError {
    BridgeError::Kafka(e.to_string())
}
