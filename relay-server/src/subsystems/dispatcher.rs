//! Work Dispatcher.
//!
//! Moves work items to worker pools and results back to sessions:
//! - items go to `relay.work.{pool}.{partition}` as durable messages, with
//!   the partition derived from the session id so one session's items share
//!   an ordering domain
//! - results come back on `relay.results.{session_id}`
//! - cancellations fan out on `relay.control.{pool}`
//! - exhausted items are copied to `relay.dlq.{pool}` and turned into a
//!   `processing_failed` result for their session
//!
//! Also hosts the worker-side harness (`run_worker` / `process`) shared by the
//! in-process loopback provider and worker pools embedded in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use metrics::{counter, histogram};
use relay_core::config::QueueConfig;
use relay_core::models::work::{decode, encode};
use relay_core::models::{
    CancelSignal, ResultPayload, ResultStatus, WorkFailure, WorkItem, WorkResult,
};
use relay_core::queue::{
    control_subject, dlq_subject, partition_for, pool_of, results_subject, work_filter,
    work_subject, ConsumerSpec, QueueBackend, WorkConsumer,
};
use relay_core::RelayError;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::session_store::SessionStoreClient;

/// Produces the output of one work item as a stream of chunks.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn handle(&self, item: &WorkItem)
        -> BoxStream<'static, Result<ResultPayload, WorkFailure>>;
}

pub struct Dispatcher {
    queue: Arc<dyn QueueBackend>,
    sessions: Arc<SessionStoreClient>,
    config: QueueConfig,
    enqueue_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn QueueBackend>,
        sessions: Arc<SessionStoreClient>,
        config: QueueConfig,
        enqueue_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            sessions,
            config,
            enqueue_timeout,
        }
    }

    pub fn queue(&self) -> &Arc<dyn QueueBackend> {
        &self.queue
    }

    pub fn partition_for(&self, session_id: &str) -> u32 {
        partition_for(session_id, self.config.partitions)
    }

    // ========================================================================
    // Gateway side
    // ========================================================================

    /// Enqueue on the default pool of the item's work kind.
    pub async fn enqueue(&self, item: &WorkItem) -> Result<(), RelayError> {
        self.enqueue_to(item.work_kind.as_str(), item).await
    }

    pub async fn enqueue_to(&self, pool: &str, item: &WorkItem) -> Result<(), RelayError> {
        let subject = work_subject(pool, self.partition_for(&item.session_id));
        let payload = encode(item)?;
        let started = std::time::Instant::now();
        let published =
            tokio::time::timeout(self.enqueue_timeout, self.queue.publish_durable(&subject, payload)).await;
        let outcome = match published {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RelayError::from(e)),
            Err(_) => Err(RelayError::Timeout { operation: "enqueue" }),
        };
        histogram!("relay_enqueue_seconds", "kind" => item.work_kind.as_str())
            .record(started.elapsed().as_secs_f64());
        counter!(
            "relay_dispatch_total",
            "kind" => item.work_kind.as_str(),
            "outcome" => if outcome.is_ok() { "enqueued" } else { "failed" }
        )
        .increment(1);
        match &outcome {
            Ok(()) => tracing::debug!(
                session_id = %item.session_id,
                kind = %item.work_kind,
                sequence = item.sequence,
                correlation_id = %item.correlation_id,
                subject = %subject,
                "Work item enqueued"
            ),
            Err(e) => tracing::warn!(
                session_id = %item.session_id,
                correlation_id = %item.correlation_id,
                "Enqueue failed: {}",
                e
            ),
        }
        outcome
    }

    /// Results for one session. The stream ends when `closed` is cancelled;
    /// subscribing again after a reconnect picks up new results.
    pub async fn subscribe_results(
        &self,
        session_id: &str,
        closed: CancellationToken,
    ) -> Result<BoxStream<'static, WorkResult>, RelayError> {
        let raw = self.queue.subscribe(&results_subject(session_id)).await?;
        Ok(raw
            .filter_map(|(subject, payload)| async move {
                match decode::<WorkResult>(&payload) {
                    Ok(result) => Some(result),
                    Err(e) => {
                        tracing::warn!(subject = %subject, "Dropping undecodable result: {}", e);
                        None
                    }
                }
            })
            .take_until(closed.cancelled_owned())
            .boxed())
    }

    /// Best-effort cancellation notice on each pool's control channel.
    pub async fn broadcast_cancel(&self, pools: &[String], signal: &CancelSignal) {
        let payload = match encode(signal) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Failed to encode cancel signal: {}", e);
                return;
            }
        };
        for pool in pools {
            if let Err(e) = self.queue.publish(&control_subject(pool), payload.clone()).await {
                tracing::warn!(pool = %pool, "Cancel broadcast failed: {}", e);
            }
        }
    }

    // ========================================================================
    // Worker side
    // ========================================================================

    /// Join a consumer group for one pool, optionally pinned to a partition.
    pub async fn consume(
        &self,
        group: &str,
        pool: &str,
        partition: Option<u32>,
    ) -> Result<Box<dyn WorkConsumer>, RelayError> {
        let filter = match partition {
            Some(p) => work_subject(pool, p),
            None => work_filter(pool),
        };
        Ok(self
            .queue
            .consumer(ConsumerSpec::from_config(group, filter, &self.config))
            .await?)
    }

    pub async fn subscribe_control(
        &self,
        pool: &str,
    ) -> Result<BoxStream<'static, CancelSignal>, RelayError> {
        let raw = self.queue.subscribe(&control_subject(pool)).await?;
        Ok(raw
            .filter_map(|(_, payload)| async move { decode::<CancelSignal>(&payload).ok() })
            .boxed())
    }

    pub async fn publish_result(&self, result: &WorkResult) -> Result<(), RelayError> {
        let payload = encode(result)?;
        self.queue
            .publish(&results_subject(&result.session_id), payload)
            .await?;
        Ok(())
    }

    pub async fn is_cancelled(&self, item: &WorkItem) -> Result<bool, RelayError> {
        self.sessions.is_cancelled(item).await
    }

    /// Run `handler` for one item and publish its chunks, polling the
    /// cancellation flag before each one.
    pub async fn process(&self, handler: &dyn WorkHandler, item: &WorkItem) -> Result<(), RelayError> {
        let mut chunks = handler.handle(item).await;
        let mut chunk: u32 = 0;
        loop {
            if self.is_cancelled(item).await.unwrap_or(false) {
                tracing::debug!(
                    session_id = %item.session_id,
                    sequence = item.sequence,
                    "Work item cancelled mid-stream"
                );
                return self
                    .publish_result(&WorkResult::for_item(item, chunk, ResultStatus::Cancelled))
                    .await;
            }
            match chunks.next().await {
                Some(Ok(payload)) => {
                    self.publish_result(
                        &WorkResult::for_item(item, chunk, ResultStatus::Delta).with_payload(payload),
                    )
                    .await?;
                    chunk += 1;
                }
                Some(Err(failure)) => {
                    let mut result = WorkResult::for_item(item, chunk, ResultStatus::Failed);
                    result.error = Some(failure);
                    return self.publish_result(&result).await;
                }
                None => {
                    return self
                        .publish_result(&WorkResult::for_item(item, chunk, ResultStatus::Completed))
                        .await;
                }
            }
        }
    }

    /// Consume a pool until `shutdown` fires, acking each item once its
    /// results are published.
    pub async fn run_worker(
        self: Arc<Self>,
        group: String,
        pool: String,
        handler: Arc<dyn WorkHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), RelayError> {
        let mut consumer = self.consume(&group, &pool, None).await?;
        tracing::info!(group = %group, pool = %pool, "Worker started");
        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = consumer.next() => match next? {
                    Some(d) => d,
                    None => break,
                },
            };

            let item: WorkItem = match decode(&delivery.payload) {
                Ok(item) => item,
                Err(e) => {
                    tracing::error!(subject = %delivery.subject, "Undecodable work item: {}", e);
                    delivery.ack().await?;
                    continue;
                }
            };

            match self.process(handler.as_ref(), &item).await {
                Ok(()) => delivery.ack().await?,
                Err(e) => {
                    tracing::warn!(
                        correlation_id = %item.correlation_id,
                        attempt = delivery.attempt,
                        "Processing failed, returning item: {}",
                        e
                    );
                    delivery.nack(None).await?;
                }
            }
        }
        tracing::info!(group = %group, pool = %pool, "Worker stopped");
        Ok(())
    }

    /// Copy dead letters to the DLQ subject and tell the owning session.
    pub async fn run_dead_letter_monitor(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), RelayError> {
        let mut letters = self.queue.dead_letters().await?;
        tracing::info!("Dead-letter monitor started");
        loop {
            let letter = tokio::select! {
                _ = shutdown.recv() => break,
                next = letters.next() => match next {
                    Some(letter) => letter,
                    None => break,
                },
            };

            let pool = pool_of(&letter.subject).unwrap_or("unknown").to_string();
            counter!("relay_dead_letters_total", "pool" => pool.clone()).increment(1);
            if let Err(e) = self.queue.publish(&dlq_subject(&pool), letter.payload.clone()).await {
                tracing::warn!(pool = %pool, "Failed to copy dead letter: {}", e);
            }

            match decode::<WorkItem>(&letter.payload) {
                Ok(item) => {
                    tracing::warn!(
                        session_id = %item.session_id,
                        correlation_id = %item.correlation_id,
                        deliveries = letter.deliveries,
                        "Work item dead-lettered"
                    );
                    let failed = WorkResult::processing_failed(&item, letter.deliveries);
                    if let Err(e) = self.publish_result(&failed).await {
                        tracing::error!(session_id = %item.session_id, "Failed to report dead letter: {}", e);
                    }
                }
                Err(e) => tracing::error!(subject = %letter.subject, "Undecodable dead letter: {}", e),
            }
        }
        Ok(())
    }
}
