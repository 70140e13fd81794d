//! In-process `StateBackend`.
//!
//! Each operation runs under one lock, which gives it the same atomicity the
//! Redis scripts provide. Expiry uses `tokio::time::Instant` so tests can
//! drive TTLs with a paused clock. Expired keys, idle windows and channels
//! without subscribers are swept at most once per `SWEEP_INTERVAL`, piggybacked
//! on writes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use super::{CasOutcome, StateBackend, VersionedRecord, WindowOutcome, WindowRequest};
use crate::error::StoreError;

const CHANNEL_CAPACITY: usize = 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    version: u64,
    heartbeat_ms: Option<i64>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| t > now)
    }
}

/// Sorted-set stand-in: (score, units) pairs, expiring a full window after
/// the last write like the Redis keys do.
#[derive(Debug)]
struct WindowSet {
    entries: Vec<(i64, u64)>,
    expires_at: Instant,
}

impl WindowSet {
    fn prune(&mut self, cutoff: i64) {
        self.entries.retain(|(score, _)| *score > cutoff);
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<String, Entry>>,
    flags: Mutex<HashMap<String, Instant>>,
    counters: Mutex<HashMap<String, (u64, Instant)>>,
    windows: Mutex<HashMap<String, WindowSet>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    last_sweep: Mutex<Option<Instant>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything that can no longer be observed.
    pub fn sweep(&self) {
        let now = Instant::now();
        *self.last_sweep.lock() = Some(now);
        self.records.lock().retain(|_, e| e.live(now));
        self.flags.lock().retain(|_, expires| *expires > now);
        self.counters.lock().retain(|_, (_, expires)| *expires > now);
        self.windows
            .lock()
            .retain(|_, w| w.expires_at > now && !w.entries.is_empty());
        self.channels.lock().retain(|_, tx| tx.receiver_count() > 0);
    }

    fn maybe_sweep(&self) {
        let due = self
            .last_sweep
            .lock()
            .map_or(true, |at| at.elapsed() >= SWEEP_INTERVAL);
        if due {
            self.sweep();
        }
    }
}

fn push_window(
    windows: &mut HashMap<String, WindowSet>,
    key: &str,
    expires_at: Instant,
    entries: impl IntoIterator<Item = (i64, u64)>,
) {
    let set = windows.entry(key.to_string()).or_insert_with(|| WindowSet {
        entries: Vec::new(),
        expires_at,
    });
    set.entries.extend(entries);
    set.expires_at = expires_at;
    if set.entries.is_empty() {
        windows.remove(key);
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<VersionedRecord>, StoreError> {
        let now = Instant::now();
        let mut records = self.records.lock();
        match records.get(key) {
            Some(entry) if entry.live(now) => Ok(Some(VersionedRecord {
                value: entry.value.clone(),
                version: entry.version,
                heartbeat_ms: entry.heartbeat_ms,
            })),
            Some(_) => {
                records.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.maybe_sweep();
        let now = Instant::now();
        let mut records = self.records.lock();
        if records.get(key).is_some_and(|e| e.live(now)) {
            return Ok(false);
        }
        records.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                version: 1,
                heartbeat_ms: None,
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: &str,
    ) -> Result<CasOutcome, StoreError> {
        let now = Instant::now();
        let mut records = self.records.lock();
        let entry = match records.get_mut(key) {
            Some(e) if e.live(now) => e,
            _ => return Ok(CasOutcome::Missing),
        };
        if entry.version != expected_version {
            return Ok(CasOutcome::VersionMismatch);
        }
        entry.version += 1;
        entry.value = value.to_string();
        Ok(CasOutcome::Applied {
            version: entry.version,
        })
    }

    async fn touch(&self, key: &str, ttl: Duration, heartbeat_ms: i64) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut records = self.records.lock();
        match records.get_mut(key) {
            Some(e) if e.live(now) => {
                e.expires_at = Some(now + ttl);
                e.heartbeat_ms = Some(heartbeat_ms);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .records
            .lock()
            .remove(key)
            .is_some_and(|e| e.live(now)))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let records = self.records.lock();
        let mut keys: Vec<String> = records
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.maybe_sweep();
        self.flags
            .lock()
            .insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn flag_exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut flags = self.flags.lock();
        match flags.get(key) {
            Some(expires) if *expires > now => Ok(true),
            Some(_) => {
                flags.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.maybe_sweep();
        let now = Instant::now();
        let mut counters = self.counters.lock();
        let slot = counters.entry(key.to_string()).or_insert((0, now + ttl));
        if slot.1 <= now {
            slot.0 = 0;
        }
        slot.0 += 1;
        slot.1 = now + ttl;
        Ok(slot.0)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        // No subscribers is not an error; the message is simply dropped.
        let mut channels = self.channels.lock();
        if let Some(tx) = channels.get(channel) {
            if tx.send(message.to_string()).is_err() {
                channels.remove(channel);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError> {
        self.maybe_sweep();
        let rx = self
            .channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        Ok(BroadcastStream::new(rx)
            .filter_map(|msg| async move { msg.ok() })
            .boxed())
    }

    async fn sliding_window(&self, request: &WindowRequest) -> Result<WindowOutcome, StoreError> {
        self.maybe_sweep();
        let mut windows = self.windows.lock();
        let cutoff = request.now_ms - request.window_ms;
        let expires_at = Instant::now() + Duration::from_millis(request.window_ms.max(0) as u64);

        let (request_count, oldest_request) = match windows.get_mut(&request.requests_key) {
            Some(set) => {
                set.prune(cutoff);
                let oldest = set.entries.iter().map(|(s, _)| *s).min();
                (set.entries.len() as u64, oldest)
            }
            None => (0, None),
        };
        let (unit_count, oldest_unit) = match windows.get_mut(&request.units_key) {
            Some(set) => {
                set.prune(cutoff);
                let oldest = set.entries.iter().map(|(s, _)| *s).min();
                (set.entries.iter().map(|(_, u)| *u).sum::<u64>(), oldest)
            }
            None => (0, None),
        };

        let oldest_ms = match (oldest_request, oldest_unit) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => request.now_ms,
        };

        if request_count + request.request_units > request.max_requests
            || unit_count + request.weighted_units > request.max_units
        {
            for key in [&request.requests_key, &request.units_key] {
                if windows.get(key).is_some_and(|set| set.entries.is_empty()) {
                    windows.remove(key);
                }
            }
            return Ok(WindowOutcome {
                allowed: false,
                request_count,
                unit_count,
                oldest_ms,
            });
        }

        if request.weighted_units > 0 {
            push_window(
                &mut windows,
                &request.units_key,
                expires_at,
                std::iter::once((request.now_ms, request.weighted_units)),
            );
        }
        push_window(
            &mut windows,
            &request.requests_key,
            expires_at,
            (0..request.request_units).map(|_| (request.now_ms, 1)),
        );

        Ok(WindowOutcome {
            allowed: true,
            request_count: request_count + request.request_units,
            unit_count: unit_count + request.weighted_units,
            oldest_ms,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(now_ms: i64, max_requests: u64, units: u64) -> WindowRequest {
        WindowRequest {
            requests_key: "rl:req".into(),
            units_key: "rl:units".into(),
            now_ms,
            window_ms: 1_000,
            max_requests,
            max_units: 100,
            request_units: 1,
            weighted_units: units,
            member: uuid::Uuid::new_v4().to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_if_absent_conflicts() {
        let backend = MemoryBackend::new();
        assert!(backend.insert_if_absent("k", "v1", Duration::from_secs(5)).await.unwrap());
        assert!(!backend.insert_if_absent("k", "v2", Duration::from_secs(5)).await.unwrap());
        let record = backend.get("k").await.unwrap().unwrap();
        assert_eq!(record.value, "v1");
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn test_compare_and_set_detects_stale_version() {
        let backend = MemoryBackend::new();
        backend.insert_if_absent("k", "v1", Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            backend.compare_and_set("k", 1, "v2").await.unwrap(),
            CasOutcome::Applied { version: 2 }
        );
        assert_eq!(
            backend.compare_and_set("k", 1, "v3").await.unwrap(),
            CasOutcome::VersionMismatch
        );
        assert_eq!(
            backend.compare_and_set("missing", 1, "v").await.unwrap(),
            CasOutcome::Missing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_and_writes_do_not_extend_ttl() {
        let backend = MemoryBackend::new();
        backend.insert_if_absent("k", "v", Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        backend.get("k").await.unwrap();
        backend.compare_and_set("k", 1, "v2").await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(backend.get("k").await.unwrap().is_none(), "only touch refreshes TTL");
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_refreshes_ttl() {
        let backend = MemoryBackend::new();
        backend.insert_if_absent("k", "v", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(backend.touch("k", Duration::from_secs(10), 42).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;
        let record = backend.get("k").await.unwrap().unwrap();
        assert_eq!(record.heartbeat_ms, Some(42));
        assert!(!backend.touch("missing", Duration::from_secs(1), 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_sliding_window_rejects_without_mutation() {
        let backend = MemoryBackend::new();
        for _ in 0..3 {
            assert!(backend.sliding_window(&window(100, 3, 10)).await.unwrap().allowed);
        }
        let rejected = backend.sliding_window(&window(200, 3, 10)).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.request_count, 3);
        assert_eq!(rejected.unit_count, 30);
        assert_eq!(rejected.oldest_ms, 100);

        // Oldest entries fall out of the window, quota frees up
        let later = backend.sliding_window(&window(1_101, 3, 10)).await.unwrap();
        assert!(later.allowed);
        assert_eq!(later.request_count, 1);
    }

    #[tokio::test]
    async fn test_sliding_window_enforces_weighted_units() {
        let backend = MemoryBackend::new();
        assert!(backend.sliding_window(&window(0, 10, 90)).await.unwrap().allowed);
        let outcome = backend.sliding_window(&window(1, 10, 20)).await.unwrap();
        assert!(!outcome.allowed, "90 + 20 exceeds 100 units");
        assert!(backend.sliding_window(&window(2, 10, 10)).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let backend = MemoryBackend::new();
        let mut sub = backend.subscribe("chan").await.unwrap();
        backend.publish("chan", "hello").await.unwrap();
        assert_eq!(sub.next().await.as_deref(), Some("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_and_flags_expire() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.increment("seq", Duration::from_secs(5)).await.unwrap(), 1);
        assert_eq!(backend.increment("seq", Duration::from_secs(5)).await.unwrap(), 2);
        backend.set_flag("cancel", Duration::from_secs(1)).await.unwrap();
        assert!(backend.flag_exists("cancel").await.unwrap());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!backend.flag_exists("cancel").await.unwrap());
        assert_eq!(backend.increment("seq", Duration::from_secs(5)).await.unwrap(), 1);
    }

    fn map_sizes(backend: &MemoryBackend) -> [usize; 5] {
        [
            backend.records.lock().len(),
            backend.flags.lock().len(),
            backend.counters.lock().len(),
            backend.windows.lock().len(),
            backend.channels.lock().len(),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_sessions_leave_nothing_behind() {
        let backend = MemoryBackend::new();
        for i in 0..20 {
            let key = format!("session:{}", i);
            backend.insert_if_absent(&key, "v", Duration::from_secs(5)).await.unwrap();
            backend.set_flag(&format!("cancel:{}", i), Duration::from_secs(5)).await.unwrap();
            backend.increment(&format!("seq:{}", i), Duration::from_secs(5)).await.unwrap();
            let mut request = window(0, 10, 1);
            request.requests_key = format!("rl:{}:req", i);
            request.units_key = format!("rl:{}:units", i);
            backend.sliding_window(&request).await.unwrap();
            let sub = backend.subscribe(&format!("changes:{}", i)).await.unwrap();
            backend.publish(&format!("changes:{}", i), "delta").await.unwrap();
            drop(sub);
            if i % 2 == 0 {
                backend.delete(&key).await.unwrap();
            }
        }
        assert_ne!(map_sizes(&backend), [0; 5]);

        // Publishing into a channel nobody listens to never creates it
        backend.publish("changes:nobody", "delta").await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        backend.sweep();
        assert_eq!(map_sizes(&backend), [0; 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_sweep_expired_state() {
        let backend = MemoryBackend::new();
        backend.set_flag("cancel:old", Duration::from_millis(100)).await.unwrap();
        backend.insert_if_absent("session:old", "v", Duration::from_millis(100)).await.unwrap();

        tokio::time::advance(SWEEP_INTERVAL).await;
        backend.set_flag("cancel:new", Duration::from_secs(60)).await.unwrap();

        assert_eq!(backend.flags.lock().len(), 1);
        assert_eq!(backend.records.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_rejected_check_on_empty_window_keeps_no_entry() {
        let backend = MemoryBackend::new();
        let outcome = backend.sliding_window(&window(0, 0, 1)).await.unwrap();
        assert!(!outcome.allowed);
        assert!(backend.windows.lock().is_empty());
    }
}
