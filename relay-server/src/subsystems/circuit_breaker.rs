//! Per-dependency circuit breakers.
//!
//! `closed → open` after `failure_threshold` consecutive failures,
//! `open → half_open` once the recovery timeout has elapsed since the last
//! failure, and `half_open` admits a single probe whose outcome decides
//! between `closed` and a fresh `open`. State is process-local.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use relay_core::config::BreakerConfig;
use relay_core::RelayError;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0 closed, 1 half-open, 2 open.
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// Bumped on every transition; outcomes from an older generation are ignored.
    generation: u64,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    /// Milliseconds since the last recorded failure.
    pub last_failure_ms_ago: Option<u64>,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    call_timeout: Duration,
    inner: Mutex<Inner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Success,
    Failure,
    /// Caller error: says nothing about the dependency's health.
    Neutral,
}

/// One admitted call, tagged with the generation it was admitted under and
/// whether it is the half-open probe. A probe abandoned before it reports
/// back frees the slot for the next caller.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl Admission<'_> {
    fn settle(mut self, verdict: Verdict) {
        self.settled = true;
        self.breaker.record(self.generation, self.probe, verdict);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.record(self.generation, true, Verdict::Neutral);
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &BreakerConfig) -> Self {
        let name = name.into();
        gauge!("relay_circuit_state", "dependency" => name.clone()).set(CircuitState::Closed.as_gauge());
        Self {
            name,
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
            call_timeout: config.call_timeout(),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                consecutive_failures: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `operation` under the breaker and the configured call timeout.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, RelayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        self.call_within(self.call_timeout, operation).await
    }

    /// Like [`call`](Self::call) with a tighter deadline. Expiry is recorded
    /// as a failure, so callers with a latency budget should pass it here
    /// rather than wrapping the call in their own timeout.
    pub async fn call_within<T, F, Fut>(&self, deadline: Duration, operation: F) -> Result<T, RelayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let admission = self.admit()?;

        let outcome = match tokio::time::timeout(deadline.min(self.call_timeout), operation()).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout {
                operation: "dependency_call",
            }),
        };

        admission.settle(match &outcome {
            Ok(_) => Verdict::Success,
            Err(e) if !e.is_retryable() => Verdict::Neutral,
            Err(_) => Verdict::Failure,
        });
        outcome
    }

    fn admit(&self) -> Result<Admission<'_>, RelayError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission {
                breaker: self,
                generation: inner.generation,
                probe: false,
                settled: false,
            }),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(self.recovery_timeout);
                if elapsed < self.recovery_timeout {
                    counter!("relay_circuit_rejections_total", "dependency" => self.name.clone())
                        .increment(1);
                    return Err(RelayError::CircuitOpen(self.name.clone()));
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.probe_in_flight = true;
                Ok(Admission {
                    breaker: self,
                    generation: inner.generation,
                    probe: true,
                    settled: false,
                })
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    counter!("relay_circuit_rejections_total", "dependency" => self.name.clone())
                        .increment(1);
                    return Err(RelayError::CircuitOpen(self.name.clone()));
                }
                inner.probe_in_flight = true;
                Ok(Admission {
                    breaker: self,
                    generation: inner.generation,
                    probe: true,
                    settled: false,
                })
            }
        }
    }

    fn record(&self, generation: u64, probe: bool, verdict: Verdict) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        if probe {
            inner.probe_in_flight = false;
            match verdict {
                Verdict::Success => {
                    inner.consecutive_failures = 0;
                    self.transition(&mut inner, CircuitState::Closed);
                }
                Verdict::Failure => {
                    inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                    inner.last_failure = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open);
                }
                Verdict::Neutral => {}
            }
            return;
        }
        match verdict {
            Verdict::Success => inner.consecutive_failures = 0,
            Verdict::Failure => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.last_failure = Some(Instant::now());
                if inner.consecutive_failures >= self.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            Verdict::Neutral => {}
        }
    }

    fn transition(&self, inner: &mut Inner, next: CircuitState) {
        let previous = inner.state;
        inner.state = next;
        inner.generation = inner.generation.wrapping_add(1);
        gauge!("relay_circuit_state", "dependency" => self.name.clone()).set(next.as_gauge());
        match next {
            CircuitState::Open => tracing::warn!(
                dependency = %self.name,
                failures = inner.consecutive_failures,
                "Circuit opened"
            ),
            _ => tracing::info!(
                dependency = %self.name,
                from = ?previous,
                to = ?next,
                "Circuit state changed"
            ),
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            dependency: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.failure_threshold,
            recovery_timeout_ms: self.recovery_timeout.as_millis() as u64,
            last_failure_ms_ago: inner.last_failure.map(|t| t.elapsed().as_millis() as u64),
        }
    }
}

/// Lazily populated map of dependency name → breaker.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(dependency) {
            return existing.clone();
        }
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(dependency, &self.config)))
            .clone()
    }

    pub async fn call<T, F, Fut>(&self, dependency: &str, operation: F) -> Result<T, RelayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        self.get(dependency).call(operation).await
    }

    pub async fn call_within<T, F, Fut>(
        &self,
        dependency: &str,
        deadline: Duration,
        operation: F,
    ) -> Result<T, RelayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        self.get(dependency).call_within(deadline, operation).await
    }

    pub fn state(&self, dependency: &str) -> Option<CircuitState> {
        self.breakers.get(dependency).map(|b| b.state())
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<BreakerSnapshot> = self.breakers.iter().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        all
    }
}
