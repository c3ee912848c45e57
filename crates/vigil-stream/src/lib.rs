//! # Vigil Stream - Kafka to Pub/Sub Streaming Bridge
//!
//! Forwards messages from a Kafka topic to a cloud Pub/Sub topic with a
//! bounded in-memory buffer between the two. Two cooperating tasks share the
//! buffer: the ingest loop polls Kafka, enriches each JSON payload with
//! provenance fields and appends to the tail; the publish loop pops the head
//! and publishes outbound.
//!
//! Delivery is at-least-once. Offsets are committed only after the matching
//! publish succeeded, auto-commit is disabled, and anything left in the buffer
//! at shutdown is re-read on the next start because its offset was never
//! committed.
//!
//! Backpressure is pause/resume on the consumer: the ingest loop stops polling
//! when the buffer reaches `buffer_max_size` and resumes once the publish loop
//! drains it to `buffer_resume_size`.

/// Consumer seam and the Kafka implementation
pub mod consumer;

/// Outbound publisher seam and the Pub/Sub REST implementation
pub mod publisher;

/// The bridge itself: buffer, backpressure, commits, shutdown
pub mod bridge;

pub use bridge::{BridgeHealth, BridgeMetricsSnapshot, BufferedMessage, StreamingBridge};
pub use consumer::{BridgeConsumer, KafkaBridgeConsumer, PolledMessage};
pub use publisher::{PublishError, Publisher, PubSubPublisher};

/// Errors raised by the streaming bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("kafka error: {0}")]
    Kafka(String),
    #[error("publish error: {0}")]
    Publish(String),
}
