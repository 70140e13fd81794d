//! Guard chain applied by the router to every client event.
//!
//! Stages run in order and either let the event continue or reject it with a
//! terminal error. Only the last stage (quota) has a side effect, so a
//! rejected event never consumes quota or touches session state.

use std::sync::Arc;

use async_trait::async_trait;
use relay_core::config::ProtocolConfig;
use relay_core::models::RateLimitResult;
use relay_core::protocol::ClientEvent;
use relay_core::{RelayError, RequestContext};

use super::auth::Principal;
use super::rate_limiter::{LimitSubject, RateLimiter};
use crate::connection::ConnectionPhase;

pub const REALTIME_SCOPE: &str = "realtime";

/// Everything a stage may look at.
pub struct GuardContext<'a> {
    pub ctx: &'a RequestContext,
    pub principal: &'a Principal,
    pub client_ip: Option<&'a str>,
    pub phase: ConnectionPhase,
    pub event: &'a ClientEvent,
    /// Audio bytes buffered and not yet committed.
    pub buffered_audio: usize,
    /// Set by the quota stage when it consulted the limiter.
    pub rate_limit: Option<RateLimitResult>,
}

#[derive(Debug)]
pub enum Verdict {
    Continue,
    Reject(RelayError),
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self, cx: &mut GuardContext<'_>) -> Verdict;
}

pub struct InterceptorChain {
    stages: Vec<Box<dyn Stage>>,
}

impl InterceptorChain {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Phase, scope, payload and quota guards, in that order.
    pub fn standard(limiter: Arc<RateLimiter>, protocol: ProtocolConfig) -> Self {
        Self::new(vec![
            Box::new(PhaseGuard),
            Box::new(ScopeGuard),
            Box::new(PayloadGuard {
                max_audio_buffer_bytes: protocol.max_audio_buffer_bytes,
            }),
            Box::new(QuotaGuard { limiter, protocol }),
        ])
    }

    pub async fn run(&self, cx: &mut GuardContext<'_>) -> Result<(), RelayError> {
        for stage in &self.stages {
            if let Verdict::Reject(error) = stage.check(cx).await {
                tracing::debug!(
                    stage = stage.name(),
                    event = cx.event.kind(),
                    correlation_id = %cx.ctx.correlation_id,
                    "Event rejected: {}",
                    error
                );
                return Err(error);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Stages
// ============================================================================

/// Only active connections accept events; a draining one still accepts
/// cancellation and close.
pub struct PhaseGuard;

#[async_trait]
impl Stage for PhaseGuard {
    fn name(&self) -> &'static str {
        "phase"
    }

    async fn check(&self, cx: &mut GuardContext<'_>) -> Verdict {
        match (cx.phase, cx.event) {
            (ConnectionPhase::Active, _) => Verdict::Continue,
            (
                ConnectionPhase::Draining,
                ClientEvent::ResponseCancel { .. } | ClientEvent::SessionClose { .. },
            ) => Verdict::Continue,
            (ConnectionPhase::Draining, _) => Verdict::Reject(RelayError::Overloaded(
                "gateway is draining, reconnect to continue".to_string(),
            )),
            (phase, _) => Verdict::Reject(RelayError::invalid(
                "invalid_state",
                format!("connection is {}", phase.as_str()),
            )),
        }
    }
}

pub struct ScopeGuard;

#[async_trait]
impl Stage for ScopeGuard {
    fn name(&self) -> &'static str {
        "scope"
    }

    async fn check(&self, cx: &mut GuardContext<'_>) -> Verdict {
        if cx.principal.has_scope(REALTIME_SCOPE) {
            Verdict::Continue
        } else {
            Verdict::Reject(RelayError::Permission(format!(
                "API key lacks the '{}' scope",
                REALTIME_SCOPE
            )))
        }
    }
}

/// Bounds the audio buffer before anything is decoded or stored.
pub struct PayloadGuard {
    pub max_audio_buffer_bytes: usize,
}

#[async_trait]
impl Stage for PayloadGuard {
    fn name(&self) -> &'static str {
        "payload"
    }

    async fn check(&self, cx: &mut GuardContext<'_>) -> Verdict {
        match cx.event {
            ClientEvent::InputAppend { audio, .. } => {
                if audio.is_empty() {
                    return Verdict::Reject(RelayError::invalid_param(
                        "invalid_value",
                        "audio must not be empty",
                        "audio",
                    ));
                }
                let decoded_estimate = audio.len() / 4 * 3;
                if cx.buffered_audio + decoded_estimate > self.max_audio_buffer_bytes {
                    return Verdict::Reject(RelayError::invalid_param(
                        "input_buffer_full",
                        format!(
                            "audio buffer would exceed {} bytes, commit or clear it first",
                            self.max_audio_buffer_bytes
                        ),
                        "audio",
                    ));
                }
                Verdict::Continue
            }
            ClientEvent::InputCommit { .. } if cx.buffered_audio == 0 => {
                Verdict::Reject(RelayError::invalid(
                    "input_buffer_empty",
                    "no audio has been appended since the last commit",
                ))
            }
            _ => Verdict::Continue,
        }
    }
}

/// Charges work-creating events against the tenant's window.
pub struct QuotaGuard {
    pub limiter: Arc<RateLimiter>,
    pub protocol: ProtocolConfig,
}

impl QuotaGuard {
    /// Weighted units for an event, or `None` when it creates no work.
    pub fn units_for(&self, cx: &GuardContext<'_>) -> Option<u64> {
        match cx.event {
            ClientEvent::InputCommit { .. } => {
                let kib = (cx.buffered_audio as u64).div_ceil(1024).max(1);
                Some(kib * self.protocol.units_per_audio_kib)
            }
            ClientEvent::ResponseCreate { .. } => Some(self.protocol.units_per_response),
            _ => None,
        }
    }
}

#[async_trait]
impl Stage for QuotaGuard {
    fn name(&self) -> &'static str {
        "quota"
    }

    async fn check(&self, cx: &mut GuardContext<'_>) -> Verdict {
        let Some(units) = self.units_for(cx) else {
            return Verdict::Continue;
        };
        let subject = limit_subject(cx.principal, cx.client_ip);
        let result = self.limiter.check_and_consume(&subject, 1, units).await;
        let verdict = if result.allowed {
            Verdict::Continue
        } else {
            Verdict::Reject(RelayError::RateLimited {
                retry_after: result.retry_after.unwrap_or_default(),
            })
        };
        cx.rate_limit = Some(result);
        verdict
    }
}

pub fn limit_subject(principal: &Principal, client_ip: Option<&str>) -> LimitSubject {
    LimitSubject {
        tenant_id: principal.tenant_id.clone(),
        tier: principal.tier.clone(),
        key_id: Some(principal.key_id.clone()),
        ip: client_ip.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::config::{BreakerConfig, RateLimitConfig};
    use relay_core::store::MemoryBackend;
    use std::time::Duration;

    use super::super::circuit_breaker::BreakerRegistry;

    fn principal(scopes: &[&str]) -> Principal {
        Principal {
            tenant_id: "acme".into(),
            tier: "pro".into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            key_id: "k1".into(),
        }
    }

    fn chain(requests_per_window: u64) -> InterceptorChain {
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            RateLimitConfig {
                requests_per_window,
                ..RateLimitConfig::default()
            },
            "relay",
            Duration::from_secs(1),
        ));
        InterceptorChain::standard(
            limiter,
            ProtocolConfig {
                max_audio_buffer_bytes: 8,
                ..ProtocolConfig::default()
            },
        )
    }

    async fn run(
        chain: &InterceptorChain,
        principal: &Principal,
        phase: ConnectionPhase,
        event: &ClientEvent,
        buffered_audio: usize,
    ) -> (Result<(), RelayError>, Option<RateLimitResult>) {
        let ctx = RequestContext::new("acme", "sess_1");
        let mut cx = GuardContext {
            ctx: &ctx,
            principal,
            client_ip: None,
            phase,
            event,
            buffered_audio,
            rate_limit: None,
        };
        let outcome = chain.run(&mut cx).await;
        (outcome, cx.rate_limit)
    }

    fn commit() -> ClientEvent {
        ClientEvent::InputCommit { event_id: None }
    }

    // ========================================================================
    // TEST 1: Quota is consumed only by work-creating events
    // ========================================================================
    #[tokio::test]
    async fn test_quota_rejects_after_limit() {
        let chain = chain(2);
        let principal = principal(&["realtime"]);
        for _ in 0..2 {
            let (outcome, limits) = run(&chain, &principal, ConnectionPhase::Active, &commit(), 4).await;
            assert!(outcome.is_ok());
            assert!(limits.unwrap().allowed);
        }
        let (outcome, limits) = run(&chain, &principal, ConnectionPhase::Active, &commit(), 4).await;
        let err = outcome.unwrap_err();
        assert_eq!(err.error_type(), "rate_limit_error");
        assert!(err.retry_after().is_some());
        assert!(!limits.unwrap().allowed);

        let clear = ClientEvent::InputClear { event_id: None };
        let (outcome, limits) = run(&chain, &principal, ConnectionPhase::Active, &clear, 0).await;
        assert!(outcome.is_ok());
        assert!(limits.is_none());
    }

    // ========================================================================
    // TEST 2: Earlier stages short-circuit before quota is consumed
    // ========================================================================
    #[tokio::test]
    async fn test_scope_rejection_consumes_nothing() {
        let chain = chain(1);
        let (outcome, limits) = run(&chain, &principal(&[]), ConnectionPhase::Active, &commit(), 4).await;
        assert_eq!(outcome.unwrap_err().code(), "insufficient_scope");
        assert!(limits.is_none());

        let (outcome, _) = run(&chain, &principal(&["realtime"]), ConnectionPhase::Active, &commit(), 4).await;
        assert!(outcome.is_ok(), "quota was untouched by the rejected event");
    }

    // ========================================================================
    // TEST 3: Phase rules
    // ========================================================================
    #[tokio::test]
    async fn test_draining_accepts_only_cancel_and_close() {
        let chain = chain(10);
        let principal = principal(&["realtime"]);
        let (outcome, _) = run(&chain, &principal, ConnectionPhase::Draining, &commit(), 4).await;
        assert_eq!(outcome.unwrap_err().code(), "overloaded");
        let cancel = ClientEvent::ResponseCancel {
            event_id: None,
            response_id: None,
        };
        let (outcome, _) = run(&chain, &principal, ConnectionPhase::Draining, &cancel, 0).await;
        assert!(outcome.is_ok());
        let (outcome, _) = run(&chain, &principal, ConnectionPhase::Authenticating, &cancel, 0).await;
        assert_eq!(outcome.unwrap_err().code(), "invalid_state");
    }

    // ========================================================================
    // TEST 4: Audio buffer bounds
    // ========================================================================
    #[tokio::test]
    async fn test_payload_bounds() {
        let chain = chain(10);
        let principal = principal(&["realtime"]);
        let append = |audio: &str| ClientEvent::InputAppend {
            event_id: None,
            audio: audio.to_string(),
        };
        let (outcome, _) = run(&chain, &principal, ConnectionPhase::Active, &append("AAAA"), 0).await;
        assert!(outcome.is_ok());
        let (outcome, _) = run(&chain, &principal, ConnectionPhase::Active, &append("AAAAAAAA"), 6).await;
        assert_eq!(outcome.unwrap_err().code(), "input_buffer_full");
        let (outcome, _) = run(&chain, &principal, ConnectionPhase::Active, &commit(), 0).await;
        assert_eq!(outcome.unwrap_err().code(), "input_buffer_empty");
    }
}
