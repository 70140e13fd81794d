//! Work-queue backend abstraction.
//!
//! Two delivery flavours travel over the same backend:
//! - **durable** subjects (`relay.work.>`) with consumer groups, ack deadlines,
//!   bounded redelivery and dead-lettering
//! - **fire-and-forget** subjects (results, control) for low-latency fan-out
//!
//! Provides a `QueueBackend` trait with implementations for:
//! - **NATS JetStream**: production, shared across gateways and workers
//! - **Memory**: single-process equivalent for development and tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::config::{BackendKind, QueueConfig};
use crate::error::QueueError;

pub mod memory;
pub mod nats;

pub use self::memory::MemoryQueue;
pub use self::nats::NatsQueue;

// ============================================================================
// Subjects
// ============================================================================

pub const WORK_PREFIX: &str = "relay.work";
pub const RESULTS_PREFIX: &str = "relay.results";
pub const CONTROL_PREFIX: &str = "relay.control";
pub const DLQ_PREFIX: &str = "relay.dlq";

pub fn work_subject(pool: &str, partition: u32) -> String {
    format!("{}.{}.{}", WORK_PREFIX, pool, partition)
}

/// Filter matching every partition of one pool.
pub fn work_filter(pool: &str) -> String {
    format!("{}.{}.*", WORK_PREFIX, pool)
}

pub fn results_subject(session_id: &str) -> String {
    format!("{}.{}", RESULTS_PREFIX, session_id)
}

pub fn control_subject(pool: &str) -> String {
    format!("{}.{}", CONTROL_PREFIX, pool)
}

pub fn dlq_subject(pool: &str) -> String {
    format!("{}.{}", DLQ_PREFIX, pool)
}

/// Pool segment of a work subject (`relay.work.{pool}.{partition}`).
pub fn pool_of(subject: &str) -> Option<&str> {
    subject
        .strip_prefix(WORK_PREFIX)?
        .strip_prefix('.')?
        .split('.')
        .next()
}

/// Stable partition for a session: 32-bit FNV-1a of the id modulo `partitions`.
pub fn partition_for(session_id: &str, partitions: u32) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in session_id.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash % partitions.max(1)
}

/// NATS-style subject matching: `*` matches one token, a trailing `>`
/// matches one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ============================================================================
// Consumers
// ============================================================================

/// Durable consumer-group settings.
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    /// Consumers sharing a group split the subject's messages between them.
    pub group: String,
    pub subject_filter: String,
    /// Redeliveries after the first attempt before the item is dead-lettered.
    pub max_retries: u32,
    pub ack_wait: Duration,
    /// Delay before each redelivery; the last entry repeats.
    pub backoff: Vec<Duration>,
    pub max_in_flight: usize,
}

impl ConsumerSpec {
    pub fn from_config(group: impl Into<String>, subject_filter: impl Into<String>, config: &QueueConfig) -> Self {
        Self {
            group: group.into(),
            subject_filter: subject_filter.into(),
            max_retries: config.max_retries,
            ack_wait: config.ack_wait(),
            backoff: config.backoff_schedule(),
            max_in_flight: 64,
        }
    }

    pub fn max_deliveries(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before delivery number `attempt + 1`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let idx = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(idx)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), QueueError>;

    /// Return the message for redelivery after `delay`.
    async fn nack(&self, delay: Option<Duration>) -> Result<(), QueueError>;
}

/// One delivery of a durable message. Dropping it without acking leaves the
/// message to be redelivered once its ack deadline passes.
pub struct Delivery {
    pub subject: String,
    pub payload: Bytes,
    /// 1 on first delivery.
    pub attempt: u32,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(subject: String, payload: Bytes, attempt: u32, acker: Box<dyn Acker>) -> Self {
        Self {
            subject,
            payload,
            attempt,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), QueueError> {
        self.acker.ack().await
    }

    pub async fn nack(self, delay: Option<Duration>) -> Result<(), QueueError> {
        self.acker.nack(delay).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("attempt", &self.attempt)
            .field("bytes", &self.payload.len())
            .finish()
    }
}

#[async_trait]
pub trait WorkConsumer: Send {
    /// Next delivery, or `None` once the backend shuts down.
    async fn next(&mut self) -> Result<Option<Delivery>, QueueError>;
}

/// A message that exhausted its deliveries.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub subject: String,
    pub payload: Bytes,
    pub deliveries: u32,
}

// ============================================================================
// Backend
// ============================================================================

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Persist a message; returns once the backend has accepted it.
    async fn publish_durable(&self, subject: &str, payload: Bytes) -> Result<(), QueueError>;

    /// Best-effort publish to live subscribers.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), QueueError>;

    /// Live subscription on a subject pattern, yielding `(subject, payload)`.
    async fn subscribe(&self, pattern: &str)
        -> Result<BoxStream<'static, (String, Bytes)>, QueueError>;

    /// Join (or create) a durable consumer group.
    async fn consumer(&self, spec: ConsumerSpec) -> Result<Box<dyn WorkConsumer>, QueueError>;

    /// Stream of messages dead-lettered by any consumer group.
    async fn dead_letters(&self) -> Result<BoxStream<'static, DeadLetter>, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;

    fn name(&self) -> &str;
}

/// Create the configured queue backend.
pub async fn create_queue(config: &QueueConfig) -> Result<Arc<dyn QueueBackend>, QueueError> {
    match config.backend {
        BackendKind::Nats => Ok(Arc::new(NatsQueue::connect(config).await?)),
        BackendKind::Memory => Ok(Arc::new(MemoryQueue::new())),
        BackendKind::Redis => Err(QueueError::Backend(
            "redis is not a work-queue backend".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_stable_and_bounded() {
        let a = partition_for("sess_abc", 16);
        assert_eq!(a, partition_for("sess_abc", 16));
        assert!(a < 16);
        assert_eq!(partition_for("anything", 1), 0);
        assert_eq!(partition_for("anything", 0), 0);
        // FNV-1a reference value for the empty string
        assert_eq!(partition_for("", u32::MAX), 0x811c_9dc5 % u32::MAX);
    }

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("relay.work.stt.*", "relay.work.stt.3"));
        assert!(!subject_matches("relay.work.stt.*", "relay.work.tts.3"));
        assert!(!subject_matches("relay.work.stt.*", "relay.work.stt"));
        assert!(subject_matches("relay.work.>", "relay.work.llm.0"));
        assert!(!subject_matches("relay.work.>", "relay.work"));
        assert!(subject_matches("relay.results.sess_1", "relay.results.sess_1"));
        assert!(!subject_matches("relay.results.sess_1", "relay.results.sess_10"));
    }

    #[test]
    fn test_pool_of_work_subject() {
        assert_eq!(pool_of(&work_subject("stt", 4)), Some("stt"));
        assert_eq!(pool_of("relay.results.sess_1"), None);
    }

    #[test]
    fn test_backoff_repeats_last_step() {
        let spec = ConsumerSpec {
            group: "g".into(),
            subject_filter: work_filter("stt"),
            max_retries: 3,
            ack_wait: Duration::from_secs(1),
            backoff: vec![Duration::from_millis(10), Duration::from_millis(20)],
            max_in_flight: 1,
        };
        assert_eq!(spec.max_deliveries(), 4);
        assert_eq!(spec.backoff_for(1), Duration::from_millis(10));
        assert_eq!(spec.backoff_for(2), Duration::from_millis(20));
        assert_eq!(spec.backoff_for(5), Duration::from_millis(20));
    }
}
