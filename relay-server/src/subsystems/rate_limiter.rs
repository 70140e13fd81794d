//! Distributed sliding-window rate limiter.
//!
//! Each subject owns two ordered sets in the shared backend: one entry per
//! request and one weighted entry per call. The check-and-consume step is a
//! single atomic backend operation, so any number of gateways can share a
//! subject without coordinating. Exhaustion is reported as a value; only the
//! backend being unreachable falls through to the fail policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use metrics::{counter, histogram};
use relay_core::config::{FailMode, LimitScope, RateLimitConfig};
use relay_core::models::{LimitSpec, RateLimitResult};
use relay_core::store::{StateBackend, WindowRequest};
use relay_core::RelayError;

use super::circuit_breaker::BreakerRegistry;

/// Breaker name guarding the rate-limit backend.
pub const DEPENDENCY: &str = "rate_limit_store";

/// Who is being limited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitSubject {
    pub tenant_id: String,
    pub tier: String,
    pub key_id: Option<String>,
    pub ip: Option<String>,
}

impl LimitSubject {
    pub fn tenant(tenant_id: impl Into<String>, tier: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            tier: tier.into(),
            key_id: None,
            ip: None,
        }
    }
}

/// Decides what happens when the backend cannot answer.
pub trait FailPolicy: Send + Sync {
    fn on_unavailable(&self, subject: &LimitSubject) -> FailMode;
}

/// Tenant override, then tier override, then the global mode.
pub struct ConfiguredFailPolicy {
    config: RateLimitConfig,
}

impl ConfiguredFailPolicy {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config }
    }
}

impl FailPolicy for ConfiguredFailPolicy {
    fn on_unavailable(&self, subject: &LimitSubject) -> FailMode {
        self.config
            .tenants
            .get(&subject.tenant_id)
            .and_then(|o| o.fail_mode)
            .or_else(|| self.config.tiers.get(&subject.tier).and_then(|o| o.fail_mode))
            .unwrap_or(self.config.fail_mode)
    }
}

pub struct RateLimiter {
    backend: Arc<dyn StateBackend>,
    breakers: Arc<BreakerRegistry>,
    policy: Arc<dyn FailPolicy>,
    config: RateLimitConfig,
    key_prefix: String,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(
        backend: Arc<dyn StateBackend>,
        breakers: Arc<BreakerRegistry>,
        config: RateLimitConfig,
        key_prefix: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let policy = Arc::new(ConfiguredFailPolicy::new(config.clone()));
        Self {
            backend,
            breakers,
            policy,
            config,
            key_prefix: key_prefix.into(),
            timeout,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn FailPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Effective limits: tenant override, then tier, then global defaults.
    pub fn resolve(&self, subject: &LimitSubject) -> LimitSpec {
        let tenant = self.config.tenants.get(&subject.tenant_id);
        let tier = self.config.tiers.get(&subject.tier);
        let pick = |f: fn(&relay_core::config::LimitOverride) -> Option<u64>, default: u64| {
            tenant
                .and_then(f)
                .or_else(|| tier.and_then(f))
                .unwrap_or(default)
        };
        LimitSpec {
            window: Duration::from_secs(self.config.window_seconds.max(1)),
            max_requests: pick(|o| o.requests_per_window, self.config.requests_per_window),
            max_units: pick(|o| o.units_per_window, self.config.units_per_window),
        }
    }

    /// Bucket key for the configured scope. The braces are a Redis Cluster
    /// hash tag so both sets land on the same shard.
    pub fn key_for(&self, subject: &LimitSubject) -> String {
        let (scope, id) = match self.config.scope {
            LimitScope::Tenant => ("tenant", subject.tenant_id.as_str()),
            LimitScope::ApiKey => ("key", subject.key_id.as_deref().unwrap_or(&subject.tenant_id)),
            LimitScope::Ip => ("ip", subject.ip.as_deref().unwrap_or("unknown")),
        };
        format!("{}:rl:{{{}:{}}}", self.key_prefix, scope, id)
    }

    pub async fn check_and_consume(
        &self,
        subject: &LimitSubject,
        request_units: u64,
        weighted_units: u64,
    ) -> RateLimitResult {
        let spec = self.resolve(subject);
        let key = self.key_for(subject);
        self.check_at(
            subject,
            &key,
            &spec,
            request_units,
            weighted_units,
            Utc::now().timestamp_millis(),
        )
        .await
    }

    /// Check against an explicit clock reading.
    pub async fn check_at(
        &self,
        subject: &LimitSubject,
        key: &str,
        spec: &LimitSpec,
        request_units: u64,
        weighted_units: u64,
        now_ms: i64,
    ) -> RateLimitResult {
        let window_ms = spec.window.as_millis() as i64;
        let request = WindowRequest {
            requests_key: format!("{}:req", key),
            units_key: format!("{}:units", key),
            now_ms,
            window_ms,
            max_requests: spec.max_requests,
            max_units: spec.max_units,
            request_units,
            weighted_units,
            member: uuid::Uuid::new_v4().simple().to_string(),
        };

        let started = std::time::Instant::now();
        let outcome = self
            .breakers
            .call(DEPENDENCY, || async {
                match tokio::time::timeout(self.timeout, self.backend.sliding_window(&request)).await {
                    Ok(result) => result.map_err(RelayError::from),
                    Err(_) => Err(RelayError::Timeout {
                        operation: "rate_limit_check",
                    }),
                }
            })
            .await;
        histogram!("relay_rate_limit_check_seconds").record(started.elapsed().as_secs_f64());

        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => return self.degrade(subject, spec, &e),
        };

        let reset_ms = outcome.oldest_ms + window_ms;
        let reset_time = Utc
            .timestamp_millis_opt(reset_ms)
            .single()
            .unwrap_or_else(Utc::now);
        let retry_after = if outcome.allowed {
            None
        } else {
            Some(Duration::from_millis((reset_ms - now_ms).max(1) as u64))
        };

        counter!(
            "relay_rate_limit_decisions_total",
            "outcome" => if outcome.allowed { "allowed" } else { "rejected" }
        )
        .increment(1);

        RateLimitResult {
            allowed: outcome.allowed,
            requests_remaining: spec.max_requests.saturating_sub(outcome.request_count),
            units_remaining: spec.max_units.saturating_sub(outcome.unit_count),
            reset_time,
            retry_after,
            degraded: false,
        }
    }

    fn degrade(&self, subject: &LimitSubject, spec: &LimitSpec, error: &RelayError) -> RateLimitResult {
        let mode = self.policy.on_unavailable(subject);
        let allowed = mode == FailMode::Open;
        tracing::warn!(
            tenant_id = %subject.tenant_id,
            tier = %subject.tier,
            fail_open = allowed,
            error = %error,
            "Rate limit backend unavailable, applying fail policy"
        );
        counter!(
            "relay_rate_limit_decisions_total",
            "outcome" => if allowed { "degraded_open" } else { "degraded_closed" }
        )
        .increment(1);
        RateLimitResult::from_policy(allowed, spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use relay_core::config::{BreakerConfig, LimitOverride};
    use relay_core::store::{CasOutcome, MemoryBackend, VersionedRecord, WindowOutcome};
    use relay_core::StoreError;

    fn limiter(backend: Arc<dyn StateBackend>, config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new(
            backend,
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            config,
            "relay",
            Duration::from_secs(1),
        )
    }

    fn small_config() -> RateLimitConfig {
        RateLimitConfig {
            window_seconds: 60,
            requests_per_window: 3,
            units_per_window: 1_000,
            ..RateLimitConfig::default()
        }
    }

    /// Backend whose every call fails.
    struct DownBackend;

    #[async_trait]
    impl StateBackend for DownBackend {
        async fn get(&self, _: &str) -> Result<Option<VersionedRecord>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn insert_if_absent(&self, _: &str, _: &str, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn compare_and_set(&self, _: &str, _: u64, _: &str) -> Result<CasOutcome, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn touch(&self, _: &str, _: Duration, _: i64) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn scan_prefix(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set_flag(&self, _: &str, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn flag_exists(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn increment(&self, _: &str, _: Duration) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn publish(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn subscribe(&self, _: &str) -> Result<BoxStream<'static, String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn sliding_window(&self, _: &WindowRequest) -> Result<WindowOutcome, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn name(&self) -> &str {
            "down"
        }
    }

    #[tokio::test]
    async fn test_exhaustion_is_a_value_with_retry_after() {
        let limiter = limiter(Arc::new(MemoryBackend::new()), small_config());
        let subject = LimitSubject::tenant("acme", "standard");
        for remaining in [2, 1, 0] {
            let result = limiter.check_and_consume(&subject, 1, 10).await;
            assert!(result.allowed);
            assert_eq!(result.requests_remaining, remaining);
        }
        let rejected = limiter.check_and_consume(&subject, 1, 10).await;
        assert!(!rejected.allowed);
        assert!(!rejected.degraded);
        let retry = rejected.retry_after.unwrap();
        assert!(retry > Duration::from_secs(50) && retry <= Duration::from_secs(60));
        assert_eq!(rejected.units_remaining, 970);
    }

    #[tokio::test]
    async fn test_overrides_resolve_tenant_then_tier() {
        let mut config = small_config();
        config.tiers.insert(
            "pro".into(),
            LimitOverride {
                requests_per_window: Some(50),
                units_per_window: Some(5_000),
                fail_mode: None,
            },
        );
        config.tenants.insert(
            "acme".into(),
            LimitOverride {
                requests_per_window: Some(500),
                ..LimitOverride::default()
            },
        );
        let limiter = limiter(Arc::new(MemoryBackend::new()), config);

        let acme = limiter.resolve(&LimitSubject::tenant("acme", "pro"));
        assert_eq!(acme.max_requests, 500);
        assert_eq!(acme.max_units, 5_000);
        let other = limiter.resolve(&LimitSubject::tenant("globex", "pro"));
        assert_eq!(other.max_requests, 50);
        let free = limiter.resolve(&LimitSubject::tenant("initech", "free"));
        assert_eq!(free.max_requests, 3);
    }

    #[tokio::test]
    async fn test_subjects_are_isolated() {
        let limiter = limiter(Arc::new(MemoryBackend::new()), small_config());
        let a = LimitSubject::tenant("a", "standard");
        let b = LimitSubject::tenant("b", "standard");
        for _ in 0..3 {
            assert!(limiter.check_and_consume(&a, 1, 1).await.allowed);
        }
        assert!(!limiter.check_and_consume(&a, 1, 1).await.allowed);
        assert!(limiter.check_and_consume(&b, 1, 1).await.allowed);
        assert_eq!(limiter.key_for(&a), "relay:rl:{tenant:a}");
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails_open_by_default() {
        let limiter = limiter(Arc::new(DownBackend), small_config());
        let result = limiter
            .check_and_consume(&LimitSubject::tenant("acme", "standard"), 1, 1)
            .await;
        assert!(result.allowed);
        assert!(result.degraded);
    }

    #[tokio::test]
    async fn test_regulated_tier_fails_closed() {
        let mut config = small_config();
        config.tiers.insert(
            "regulated".into(),
            LimitOverride {
                fail_mode: Some(FailMode::Closed),
                ..LimitOverride::default()
            },
        );
        let limiter = limiter(Arc::new(DownBackend), config);
        let result = limiter
            .check_and_consume(&LimitSubject::tenant("bank", "regulated"), 1, 1)
            .await;
        assert!(!result.allowed);
        assert!(result.degraded);
        assert!(result.retry_after.is_some());
    }

    #[tokio::test]
    async fn test_injected_policy_wins() {
        struct AlwaysClosed;
        impl FailPolicy for AlwaysClosed {
            fn on_unavailable(&self, _: &LimitSubject) -> FailMode {
                FailMode::Closed
            }
        }
        let limiter = limiter(Arc::new(DownBackend), small_config()).with_policy(Arc::new(AlwaysClosed));
        let result = limiter
            .check_and_consume(&LimitSubject::tenant("acme", "standard"), 1, 1)
            .await;
        assert!(!result.allowed);
    }
}
