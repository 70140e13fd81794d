//! Shared-state backend for everything gateways must agree on.
//!
//! Provides a `StateBackend` trait with implementations for:
//! - **Redis**: the clustered production backend; multi-step operations run
//!   as server-side Lua scripts so they are atomic across gateway instances
//! - **Memory**: a single-process backend with identical semantics, used for
//!   development and tests
//!
//! Records are versioned: every successful conditional write bumps the
//! version, which callers use as their unmodified-since token. Record TTLs
//! are only ever refreshed through `touch`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::{BackendKind, StoreConfig};
use crate::error::StoreError;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// A record together with its version token.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord {
    pub value: String,
    pub version: u64,
    /// Last heartbeat written by `touch`, in epoch milliseconds.
    pub heartbeat_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied { version: u64 },
    VersionMismatch,
    Missing,
}

/// Arguments of one atomic sliding-window check.
#[derive(Debug, Clone)]
pub struct WindowRequest {
    pub requests_key: String,
    pub units_key: String,
    pub now_ms: i64,
    pub window_ms: i64,
    pub max_requests: u64,
    pub max_units: u64,
    pub request_units: u64,
    pub weighted_units: u64,
    /// Per-call disambiguator so concurrent entries at the same millisecond
    /// do not collapse into one set member.
    pub member: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub allowed: bool,
    /// Counts after the call (including the increment when allowed).
    pub request_count: u64,
    pub unit_count: u64,
    /// Score of the oldest entry still inside the window.
    pub oldest_ms: i64,
}

#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<VersionedRecord>, StoreError>;

    /// Create the record at version 1 with `ttl` unless the key exists.
    async fn insert_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Replace the value if the stored version still equals `expected_version`.
    /// The record's TTL is left untouched.
    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: &str,
    ) -> Result<CasOutcome, StoreError>;

    /// Refresh the TTL and heartbeat stamp without reading the value.
    /// Returns false when the record no longer exists.
    async fn touch(&self, key: &str, ttl: Duration, heartbeat_ms: i64) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Keys of versioned records starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn flag_exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically increment a counter (starting at 1) and refresh its TTL.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError>;

    async fn sliding_window(&self, request: &WindowRequest) -> Result<WindowOutcome, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// Create the configured backend. Redis connects eagerly so a bad URL fails
/// at startup rather than on the first client.
pub async fn create_backend(config: &StoreConfig) -> Result<Arc<dyn StateBackend>, StoreError> {
    match config.backend {
        BackendKind::Redis => Ok(Arc::new(RedisBackend::connect(&config.url).await?)),
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
        BackendKind::Nats => Err(StoreError::Unavailable(
            "nats is not a shared-state backend".to_string(),
        )),
    }
}
