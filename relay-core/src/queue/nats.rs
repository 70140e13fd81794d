//! NATS JetStream `QueueBackend`.
//!
//! Work subjects are captured by one stream; consumer groups are durable
//! pull consumers. Redelivery timing and the delivery cap are enforced by
//! the server, which announces exhausted messages through its
//! `MAX_DELIVERIES` advisory; the dead-letter stream turns those advisories
//! back into the original messages.

use std::time::Duration;

use async_nats::jetstream::{self, consumer, stream, AckKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::Deserialize;

use super::{
    Acker, ConsumerSpec, DeadLetter, Delivery, QueueBackend, WorkConsumer, WORK_PREFIX,
};
use crate::config::QueueConfig;
use crate::error::QueueError;

/// Work items older than this are discarded by the stream.
const STREAM_MAX_AGE: Duration = Duration::from_secs(3600);

pub struct NatsQueue {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    stream: stream::Stream,
    stream_name: String,
}

impl NatsQueue {
    pub async fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
        tracing::info!("Connecting to NATS at {}", config.url);
        let client = async_nats::connect(&config.url)
            .await
            .map_err(QueueError::backend)?;
        let jetstream = jetstream::new(client.clone());

        let stream = jetstream
            .get_or_create_stream(stream::Config {
                name: config.stream_name.clone(),
                subjects: vec![format!("{}.>", WORK_PREFIX)],
                retention: stream::RetentionPolicy::Limits,
                max_age: STREAM_MAX_AGE,
                storage: stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(QueueError::backend)?;
        tracing::info!("Stream '{}' ready", config.stream_name);

        Ok(Self {
            client,
            jetstream,
            stream,
            stream_name: config.stream_name.clone(),
        })
    }
}

/// Durable names may not contain `.`, `*`, `>` or whitespace.
fn durable_name(group: &str) -> String {
    group
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[derive(Debug, Deserialize)]
struct MaxDeliveriesAdvisory {
    stream_seq: u64,
    deliveries: u32,
}

#[async_trait]
impl QueueBackend for NatsQueue {
    async fn publish_durable(&self, subject: &str, payload: Bytes) -> Result<(), QueueError> {
        self.jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(QueueError::backend)?
            .await
            .map_err(QueueError::backend)?;
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), QueueError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(QueueError::backend)
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<BoxStream<'static, (String, Bytes)>, QueueError> {
        let subscriber = self
            .client
            .subscribe(pattern.to_string())
            .await
            .map_err(QueueError::backend)?;
        Ok(subscriber
            .map(|msg| (msg.subject.to_string(), msg.payload))
            .boxed())
    }

    async fn consumer(&self, spec: ConsumerSpec) -> Result<Box<dyn WorkConsumer>, QueueError> {
        let name = durable_name(&spec.group);
        // The server applies backoff[i] as the ack deadline of delivery i+1.
        let backoff = spec.backoff.iter().map(|d| spec.ack_wait + *d).collect();
        let consumer = self
            .stream
            .get_or_create_consumer(
                &name,
                consumer::pull::Config {
                    durable_name: Some(name.clone()),
                    filter_subject: spec.subject_filter.clone(),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ack_wait: spec.ack_wait,
                    max_deliver: i64::from(spec.max_deliveries()),
                    backoff,
                    max_ack_pending: spec.max_in_flight as i64,
                    ..Default::default()
                },
            )
            .await
            .map_err(QueueError::backend)?;
        let messages = consumer.messages().await.map_err(QueueError::backend)?;
        tracing::info!(group = %name, filter = %spec.subject_filter, "Joined consumer group");
        Ok(Box::new(NatsConsumer { messages }))
    }

    async fn dead_letters(&self) -> Result<BoxStream<'static, DeadLetter>, QueueError> {
        let advisories = self
            .client
            .subscribe(format!(
                "$JS.EVENT.ADVISORY.CONSUMER.MAX_DELIVERIES.{}.*",
                self.stream_name
            ))
            .await
            .map_err(QueueError::backend)?;
        let stream = self.stream.clone();
        Ok(advisories
            .filter_map(move |msg| {
                let stream = stream.clone();
                async move {
                    let advisory: MaxDeliveriesAdvisory = match serde_json::from_slice(&msg.payload) {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!("Unreadable max-deliveries advisory: {}", e);
                            return None;
                        }
                    };
                    match stream.get_raw_message(advisory.stream_seq).await {
                        Ok(raw) => Some(DeadLetter {
                            subject: raw.subject.to_string(),
                            payload: raw.payload,
                            deliveries: advisory.deliveries,
                        }),
                        Err(e) => {
                            tracing::warn!(seq = advisory.stream_seq, "Dead-lettered message unavailable: {}", e);
                            None
                        }
                    }
                }
            })
            .boxed())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.client.flush().await.map_err(QueueError::backend)
    }

    fn name(&self) -> &str {
        "nats"
    }
}

struct NatsConsumer {
    messages: consumer::pull::Stream,
}

#[async_trait]
impl WorkConsumer for NatsConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>, QueueError> {
        let message = match self.messages.next().await {
            Some(m) => m.map_err(QueueError::backend)?,
            None => return Ok(None),
        };
        let attempt = message
            .info()
            .map(|info| info.delivered.max(1) as u32)
            .unwrap_or(1);
        Ok(Some(Delivery::new(
            message.subject.to_string(),
            message.payload.clone(),
            attempt,
            Box::new(NatsAcker { message }),
        )))
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.message.ack().await.map_err(QueueError::backend)
    }

    async fn nack(&self, delay: Option<Duration>) -> Result<(), QueueError> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(QueueError::backend)
    }
}
