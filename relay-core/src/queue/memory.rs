//! In-process `QueueBackend` with JetStream-like consumer groups.
//!
//! Durable messages are kept in a bounded log so a group created after the
//! publish still sees them. Each group tracks its own ready queue and
//! in-flight set; an in-flight message whose ack deadline passes goes back to
//! the ready queue after its backoff, or to the dead letters once it has
//! used up its deliveries.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};

use super::{
    subject_matches, Acker, ConsumerSpec, DeadLetter, Delivery, QueueBackend, WorkConsumer,
};
use crate::error::QueueError;

const MAX_RETAINED: usize = 100_000;
const IDLE_POLL: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct Message {
    subject: String,
    payload: Bytes,
}

struct Ready {
    message: Arc<Message>,
    deliveries: u32,
    available_at: Instant,
}

struct InFlight {
    message: Arc<Message>,
    deliveries: u32,
    deadline: Instant,
}

struct Group {
    spec: ConsumerSpec,
    ready: VecDeque<Ready>,
    in_flight: HashMap<u64, InFlight>,
    next_token: u64,
}

impl Group {
    /// Put a returned message back, or dead-letter it when out of deliveries.
    fn retire(
        &mut self,
        message: Arc<Message>,
        deliveries: u32,
        available_at: Instant,
    ) -> Option<DeadLetter> {
        if deliveries >= self.spec.max_deliveries() {
            return Some(DeadLetter {
                subject: message.subject.clone(),
                payload: message.payload.clone(),
                deliveries,
            });
        }
        self.ready.push_back(Ready {
            message,
            deliveries,
            available_at,
        });
        None
    }

    fn reap_expired(&mut self, now: Instant) -> Vec<DeadLetter> {
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(token, _)| *token)
            .collect();
        let mut dead = Vec::new();
        for token in expired {
            if let Some(f) = self.in_flight.remove(&token) {
                let available_at = now + self.spec.backoff_for(f.deliveries);
                dead.extend(self.retire(f.message, f.deliveries, available_at));
            }
        }
        dead
    }

    fn next_wake(&self) -> Option<Instant> {
        let ready = self.ready.iter().map(|r| r.available_at).min();
        let deadline = self.in_flight.values().map(|f| f.deadline).min();
        match (ready, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

struct Shared {
    group: Mutex<Group>,
    notify: Notify,
    dead: broadcast::Sender<DeadLetter>,
}

impl Shared {
    fn report(&self, dead: Vec<DeadLetter>) {
        for letter in dead {
            tracing::warn!(
                subject = %letter.subject,
                deliveries = letter.deliveries,
                "Message exhausted its deliveries"
            );
            let _ = self.dead.send(letter);
        }
    }
}

#[derive(Default)]
struct Inner {
    log: VecDeque<Arc<Message>>,
    groups: HashMap<String, Arc<Shared>>,
    subscribers: Vec<(String, mpsc::UnboundedSender<(String, Bytes)>)>,
}

pub struct MemoryQueue {
    inner: Mutex<Inner>,
    dead: broadcast::Sender<DeadLetter>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (dead, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner::default()),
            dead,
        }
    }

    fn fan_out(inner: &mut Inner, subject: &str, payload: &Bytes) {
        inner.subscribers.retain(|(pattern, tx)| {
            if tx.is_closed() {
                return false;
            }
            if subject_matches(pattern, subject) {
                let _ = tx.send((subject.to_string(), payload.clone()));
            }
            true
        });
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn publish_durable(&self, subject: &str, payload: Bytes) -> Result<(), QueueError> {
        let message = Arc::new(Message {
            subject: subject.to_string(),
            payload: payload.clone(),
        });
        let now = Instant::now();
        let mut inner = self.inner.lock();

        inner.log.push_back(message.clone());
        if inner.log.len() > MAX_RETAINED {
            inner.log.pop_front();
        }

        for shared in inner.groups.values() {
            let mut group = shared.group.lock();
            if subject_matches(&group.spec.subject_filter, subject) {
                group.ready.push_back(Ready {
                    message: message.clone(),
                    deliveries: 0,
                    available_at: now,
                });
                drop(group);
                shared.notify.notify_waiters();
            }
        }

        Self::fan_out(&mut inner, subject, &payload);
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), QueueError> {
        Self::fan_out(&mut self.inner.lock(), subject, &payload);
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<BoxStream<'static, (String, Bytes)>, QueueError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push((pattern.to_string(), tx));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn consumer(&self, spec: ConsumerSpec) -> Result<Box<dyn WorkConsumer>, QueueError> {
        let mut inner = self.inner.lock();
        let shared = match inner.groups.get(&spec.group) {
            Some(existing) => existing.clone(),
            None => {
                let now = Instant::now();
                let ready = inner
                    .log
                    .iter()
                    .filter(|m| subject_matches(&spec.subject_filter, &m.subject))
                    .map(|m| Ready {
                        message: m.clone(),
                        deliveries: 0,
                        available_at: now,
                    })
                    .collect();
                tracing::debug!(group = %spec.group, filter = %spec.subject_filter, "Creating consumer group");
                let shared = Arc::new(Shared {
                    group: Mutex::new(Group {
                        spec: spec.clone(),
                        ready,
                        in_flight: HashMap::new(),
                        next_token: 0,
                    }),
                    notify: Notify::new(),
                    dead: self.dead.clone(),
                });
                inner.groups.insert(spec.group.clone(), shared.clone());
                shared
            }
        };
        Ok(Box::new(MemoryConsumer { shared }))
    }

    async fn dead_letters(&self) -> Result<BoxStream<'static, DeadLetter>, QueueError> {
        Ok(BroadcastStream::new(self.dead.subscribe())
            .filter_map(|letter| async move { letter.ok() })
            .boxed())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemoryConsumer {
    shared: Arc<Shared>,
}

#[async_trait]
impl WorkConsumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>, QueueError> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (delivery, dead, wake) = {
                let mut group = self.shared.group.lock();
                let now = Instant::now();
                let dead = group.reap_expired(now);

                let mut delivery = None;
                if group.in_flight.len() < group.spec.max_in_flight.max(1) {
                    if let Some(pos) = group.ready.iter().position(|r| r.available_at <= now) {
                        if let Some(ready) = group.ready.remove(pos) {
                            let token = group.next_token;
                            group.next_token += 1;
                            let deliveries = ready.deliveries + 1;
                            let deadline = now + group.spec.ack_wait;
                            group.in_flight.insert(
                                token,
                                InFlight {
                                    message: ready.message.clone(),
                                    deliveries,
                                    deadline,
                                },
                            );
                            delivery = Some(Delivery::new(
                                ready.message.subject.clone(),
                                ready.message.payload.clone(),
                                deliveries,
                                Box::new(MemoryAcker {
                                    shared: self.shared.clone(),
                                    token,
                                }),
                            ));
                        }
                    }
                }
                (delivery, dead, group.next_wake())
            };

            self.shared.report(dead);
            if delivery.is_some() {
                return Ok(delivery);
            }

            let wake = wake.unwrap_or_else(|| Instant::now() + IDLE_POLL);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    token: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        // A late ack for a message already redelivered is a no-op.
        self.shared.group.lock().in_flight.remove(&self.token);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, delay: Option<Duration>) -> Result<(), QueueError> {
        let dead = {
            let mut group = self.shared.group.lock();
            match group.in_flight.remove(&self.token) {
                Some(f) => {
                    let delay = delay.unwrap_or_else(|| group.spec.backoff_for(f.deliveries));
                    group.retire(f.message, f.deliveries, Instant::now() + delay)
                }
                None => None,
            }
        };
        self.shared.report(dead.into_iter().collect());
        self.shared.notify.notify_waiters();
        Ok(())
    }
}
