//! Gateway service: shared state for every connection on this instance.
//!
//! Owns the subsystem clients, admits new connections, fans out
//! cancellations, and keeps the local connection registry used for graceful
//! shutdown. Nothing here is shared with other gateway instances except
//! through the session store and the work queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, gauge};
use relay_core::config::RelayConfig;
use relay_core::context::{new_correlation_id, new_session_id};
use relay_core::models::{CancelSignal, Session, SessionStatus, WorkKind};
use relay_core::queue::QueueBackend;
use relay_core::store::StateBackend;
use relay_core::{RelayError, RequestContext};
use sqlx::PgPool;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::subsystems::auth::{Authenticator, Credentials, Principal};
use crate::subsystems::circuit_breaker::BreakerRegistry;
use crate::subsystems::dispatcher::Dispatcher;
use crate::subsystems::interceptors::InterceptorChain;
use crate::subsystems::providers::Providers;
use crate::subsystems::rate_limiter::RateLimiter;
use crate::subsystems::session_store::{CancelScope, SessionStoreClient};

/// Breaker name guarding session store calls made during admission.
pub const SESSION_STORE_DEPENDENCY: &str = "session_store";

/// A connection that passed authentication and owns a live session.
#[derive(Debug, Clone)]
pub struct Admission {
    pub ctx: RequestContext,
    pub principal: Principal,
    pub session: Session,
    pub client_ip: Option<String>,
    pub restored: bool,
}

/// What a cancellation targets.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelTarget {
    Response(String),
    /// Everything enqueued so far, up to these sequence numbers per kind.
    Session(HashMap<WorkKind, u64>),
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: String,
    pub session_id: String,
    pub tenant_id: String,
    pub drain: CancellationToken,
}

pub struct Gateway {
    pub gateway_id: String,
    pub config: RelayConfig,
    pub sessions: Arc<SessionStoreClient>,
    pub limiter: Arc<RateLimiter>,
    pub dispatcher: Arc<Dispatcher>,
    pub providers: Arc<Providers>,
    pub breakers: Arc<BreakerRegistry>,
    pub auth: Authenticator,
    pub chain: InterceptorChain,
    connections: DashMap<String, ConnectionHandle>,
    draining: AtomicBool,
}

impl Gateway {
    pub fn new(
        config: RelayConfig,
        state: Arc<dyn StateBackend>,
        queue: Arc<dyn QueueBackend>,
        pool: Option<PgPool>,
    ) -> Arc<Self> {
        let gateway_id = if config.service.gateway_id.is_empty() {
            format!("gw_{}", Uuid::new_v4().simple())
        } else {
            config.service.gateway_id.clone()
        };
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let sessions = Arc::new(SessionStoreClient::new(
            state.clone(),
            config.store.clone(),
            gateway_id.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            state,
            breakers.clone(),
            config.rate_limit.clone(),
            config.store.key_prefix.clone(),
            config.timeouts.rate_limit(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            queue,
            sessions.clone(),
            config.queue.clone(),
            config.timeouts.enqueue(),
        ));
        let providers = Arc::new(Providers::from_config(
            &config.providers,
            dispatcher.clone(),
            breakers.clone(),
        ));
        let auth = Authenticator::new(
            &config.auth,
            pool,
            breakers.clone(),
            config.timeouts.admission(),
        );
        let chain = InterceptorChain::standard(limiter.clone(), config.protocol.clone());

        tracing::info!(gateway_id = %gateway_id, "Gateway initialised");
        Arc::new(Self {
            gateway_id,
            config,
            sessions,
            limiter,
            dispatcher,
            providers,
            breakers,
            auth,
            chain,
            connections: DashMap::new(),
            draining: AtomicBool::new(false),
        })
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Authenticate and create or restore the caller's session. Transient
    /// store failures are retried once before surfacing as overload.
    pub async fn admit(&self, credentials: &Credentials) -> Result<Admission, RelayError> {
        if self.is_draining() {
            return Err(RelayError::Overloaded("gateway is shutting down".to_string()));
        }

        let api_key = credentials.api_key.as_deref().unwrap_or_default();
        let principal = self.auth.authenticate(api_key).await;
        let principal = match principal {
            Ok(p) => p,
            Err(e) => {
                counter!("relay_admissions_total", "outcome" => e.code()).increment(1);
                return Err(e);
            }
        };

        let strategy = ExponentialBackoff::from_millis(10).map(jitter).take(1);
        let outcome = RetryIf::spawn(
            strategy,
            || self.open_session(&principal, credentials),
            |e: &RelayError| e.is_transient(),
        )
        .await;

        match outcome {
            Ok(admission) => {
                counter!(
                    "relay_admissions_total",
                    "outcome" => if admission.restored { "restored" } else { "created" }
                )
                .increment(1);
                tracing::info!(
                    session_id = %admission.ctx.session_id,
                    tenant_id = %admission.ctx.tenant_id,
                    restored = admission.restored,
                    "Connection admitted"
                );
                Ok(admission)
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(tenant_id = %principal.tenant_id, "Admission failed after retry: {}", e);
                counter!("relay_admissions_total", "outcome" => "overloaded").increment(1);
                Err(RelayError::Overloaded(
                    "session store unavailable, retry shortly".to_string(),
                ))
            }
            Err(e) => {
                counter!("relay_admissions_total", "outcome" => e.code()).increment(1);
                Err(e)
            }
        }
    }

    async fn open_session(
        &self,
        principal: &Principal,
        credentials: &Credentials,
    ) -> Result<Admission, RelayError> {
        let budget = match credentials.session_id {
            Some(_) => self.config.timeouts.restore(),
            None => self.config.timeouts.admission(),
        };
        // The budget runs inside the breaker so a hung store trips it.
        let (session, restored) = self
            .breakers
            .call_within(SESSION_STORE_DEPENDENCY, budget, || async {
                match &credentials.session_id {
                    Some(id) => self.restore(principal, id).await.map(|s| (s, true)),
                    None => self.create(principal).await.map(|s| (s, false)),
                }
            })
            .await?;
        Ok(Admission {
            ctx: RequestContext {
                tenant_id: principal.tenant_id.clone(),
                session_id: session.id.clone(),
                correlation_id: new_correlation_id(),
            },
            principal: principal.clone(),
            session,
            client_ip: credentials.client_ip.clone(),
            restored,
        })
    }

    async fn create(&self, principal: &Principal) -> Result<Session, RelayError> {
        let ctx = RequestContext::new(&principal.tenant_id, new_session_id());
        self.sessions.create(&ctx, serde_json::json!({})).await?;
        self.sessions.mark_connected(&ctx.session_id).await
    }

    async fn restore(&self, principal: &Principal, session_id: &str) -> Result<Session, RelayError> {
        let session = self.sessions.get(session_id).await?;
        // Another tenant's session is indistinguishable from a missing one
        if session.tenant_id != principal.tenant_id || session.status == SessionStatus::Expired {
            return Err(RelayError::NotFound(format!("session {}", session_id)));
        }
        self.sessions.mark_connected(session_id).await
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Record the cancellation in the shared store and tell the worker pools.
    /// Local suppression of buffered output is the connection's job.
    pub async fn cancel(&self, ctx: &RequestContext, target: &CancelTarget) -> Result<(), RelayError> {
        let (scope, response_id) = match target {
            CancelTarget::Response(id) => (CancelScope::Response(id.clone()), Some(id.clone())),
            CancelTarget::Session(marks) => (CancelScope::Session(marks.clone()), None),
        };
        self.sessions.set_cancelled(&ctx.session_id, &scope).await?;

        let signal = CancelSignal {
            session_id: ctx.session_id.clone(),
            response_id,
            issued_at: chrono::Utc::now(),
        };
        let pools: Vec<String> = WorkKind::ALL
            .iter()
            .flat_map(|kind| self.providers.pools_for(*kind))
            .collect();
        self.dispatcher.broadcast_cancel(&pools, &signal).await;
        counter!("relay_cancellations_total").increment(1);
        tracing::info!(
            session_id = %ctx.session_id,
            correlation_id = %ctx.correlation_id,
            response_id = ?signal.response_id,
            "Cancellation issued"
        );
        Ok(())
    }

    // ========================================================================
    // Connection registry
    // ========================================================================

    pub fn register_connection(&self, ctx: &RequestContext) -> ConnectionHandle {
        let handle = ConnectionHandle {
            id: format!("conn_{}", Uuid::new_v4().simple()),
            session_id: ctx.session_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            drain: CancellationToken::new(),
        };
        if self.is_draining() {
            handle.drain.cancel();
        }
        self.connections.insert(handle.id.clone(), handle.clone());
        counter!("relay_connections_total").increment(1);
        gauge!("relay_active_connections").set(self.connections.len() as f64);
        handle
    }

    pub fn deregister_connection(&self, id: &str) {
        self.connections.remove(id);
        gauge!("relay_active_connections").set(self.connections.len() as f64);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Stop admitting, ask every connection to drain, and wait for them to
    /// finish or for `timeout` to pass. Returns the connections left open.
    pub async fn drain(&self, timeout: Duration) -> usize {
        self.draining.store(true, Ordering::SeqCst);
        for entry in self.connections.iter() {
            entry.drain.cancel();
        }
        tracing::info!(connections = self.connections.len(), "Draining gateway");

        let deadline = tokio::time::Instant::now() + timeout;
        while !self.connections.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.connections.len();
        if remaining > 0 {
            tracing::warn!(remaining, "Drain timed out with open connections");
        }
        remaining
    }
}
