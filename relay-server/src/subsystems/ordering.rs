//! Per-kind reorder buffer for worker results.
//!
//! Workers may finish items out of order and results can be redelivered.
//! The buffer releases results in `(sequence, chunk)` order for the items this
//! connection registered, drops duplicates, and gives up on a stalled head
//! item once later results have waited longer than the gap timeout or the
//! buffer is full. A given-up item is reported instead of blocking the stream.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use metrics::counter;
use relay_core::config::OrderingConfig;
use relay_core::models::{ResultStatus, WorkKind, WorkResult};
use relay_core::protocol::PartialReason;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum Release {
    Deliver(WorkResult),
    /// The item will not be completed in order; later results follow.
    Skipped { sequence: u64, reason: PartialReason },
}

#[derive(Debug)]
pub struct ReorderBuffer {
    capacity: usize,
    gap_timeout: Duration,
    /// Registered, non-terminal items and the next chunk expected from each.
    outstanding: BTreeMap<u64, u32>,
    pending: BTreeMap<(u64, u32), WorkResult>,
    /// Last time the head advanced while something was waiting behind it.
    stalled_since: Option<Instant>,
}

impl ReorderBuffer {
    pub fn new(capacity: usize, gap_timeout: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            gap_timeout,
            outstanding: BTreeMap::new(),
            pending: BTreeMap::new(),
            stalled_since: None,
        }
    }

    /// Expect results for `sequence`. Must be called before the item is submitted.
    pub fn register(&mut self, sequence: u64) {
        self.outstanding.entry(sequence).or_insert(0);
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn insert(&mut self, result: WorkResult, now: Instant) -> Vec<Release> {
        let Some(&next_chunk) = self.outstanding.get(&result.sequence) else {
            counter!("relay_results_dropped_total", "reason" => "unknown").increment(1);
            return Vec::new();
        };
        if result.chunk < next_chunk || self.pending.contains_key(&result.key()) {
            counter!("relay_results_dropped_total", "reason" => "duplicate").increment(1);
            return Vec::new();
        }
        self.pending.insert(result.key(), result);

        let mut released = self.drain(now);
        if self.pending.len() > self.capacity {
            released.extend(self.skip_head(PartialReason::BufferOverflow, now));
        }
        released
    }

    /// Give up on a head that has been stalled past the gap timeout.
    pub fn poll(&mut self, now: Instant) -> Vec<Release> {
        match self.stalled_since {
            Some(since) if now.duration_since(since) >= self.gap_timeout => {
                self.skip_head(PartialReason::GapTimeout, now)
            }
            _ => Vec::new(),
        }
    }

    /// When `poll` should next be called.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.stalled_since.map(|since| since + self.gap_timeout)
    }

    /// Forget items (e.g. on cancellation), discarding anything buffered for them.
    pub fn forget(&mut self, sequences: &[u64], now: Instant) -> Vec<Release> {
        for sequence in sequences {
            self.outstanding.remove(sequence);
        }
        self.pending.retain(|(seq, _), _| !sequences.contains(seq));
        self.drain(now)
    }

    pub fn clear(&mut self) {
        self.outstanding.clear();
        self.pending.clear();
        self.stalled_since = None;
    }

    fn drain(&mut self, now: Instant) -> Vec<Release> {
        let mut released = Vec::new();
        let mut advanced = false;
        while let Some((&head, &chunk)) = self.outstanding.iter().next() {
            let next = match self.pending.remove(&(head, chunk)) {
                Some(result) => Some(result),
                None => self.take_early_failure(head),
            };
            let Some(result) = next else { break };
            advanced = true;
            if result.status.is_terminal() {
                self.outstanding.remove(&head);
                self.pending.retain(|(seq, _), _| *seq != head);
            } else if let Some(slot) = self.outstanding.get_mut(&head) {
                *slot = chunk + 1;
            }
            released.push(Release::Deliver(result));
        }

        if self.pending.is_empty() {
            self.stalled_since = None;
        } else if advanced || self.stalled_since.is_none() {
            self.stalled_since = Some(now);
        }
        released
    }

    /// A failure or cancellation for the head is delivered as soon as it
    /// arrives, whatever chunk it carries.
    fn take_early_failure(&mut self, head: u64) -> Option<WorkResult> {
        let key = self
            .pending
            .range((head, 0)..=(head, u32::MAX))
            .find(|(_, r)| matches!(r.status, ResultStatus::Failed | ResultStatus::Cancelled))
            .map(|(k, _)| *k)?;
        self.pending.remove(&key)
    }

    fn skip_head(&mut self, reason: PartialReason, now: Instant) -> Vec<Release> {
        let Some((&head, _)) = self.outstanding.iter().next() else {
            return Vec::new();
        };
        tracing::warn!(sequence = head, ?reason, "Giving up on stalled work item");
        counter!(
            "relay_partial_results_total",
            "reason" => match reason {
                PartialReason::GapTimeout => "gap_timeout",
                PartialReason::BufferOverflow => "buffer_overflow",
            }
        )
        .increment(1);
        self.outstanding.remove(&head);
        self.pending.retain(|(seq, _), _| *seq != head);
        self.stalled_since = None;
        let mut released = vec![Release::Skipped {
            sequence: head,
            reason,
        }];
        released.extend(self.drain(now));
        released
    }
}

/// One reorder buffer per work kind.
#[derive(Debug)]
pub struct KindBuffers {
    config: OrderingConfig,
    buffers: HashMap<WorkKind, ReorderBuffer>,
}

impl KindBuffers {
    pub fn new(config: &OrderingConfig) -> Self {
        Self {
            config: config.clone(),
            buffers: HashMap::new(),
        }
    }

    pub fn get_mut(&mut self, kind: WorkKind) -> &mut ReorderBuffer {
        let config = &self.config;
        self.buffers
            .entry(kind)
            .or_insert_with(|| ReorderBuffer::new(config.buffer_capacity, config.gap_timeout()))
    }

    pub fn is_idle(&self) -> bool {
        self.buffers.values().all(ReorderBuffer::is_idle)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.buffers.values().filter_map(ReorderBuffer::next_deadline).min()
    }

    /// Poll every kind, tagging releases with their kind.
    pub fn poll(&mut self, now: Instant) -> Vec<(WorkKind, Release)> {
        let mut released = Vec::new();
        for (kind, buffer) in self.buffers.iter_mut() {
            released.extend(buffer.poll(now).into_iter().map(|r| (*kind, r)));
        }
        released
    }

    pub fn clear(&mut self) {
        self.buffers.values_mut().for_each(ReorderBuffer::clear);
    }
}
