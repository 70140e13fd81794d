//! Per-connection lifecycle and the connection loop.
//!
//! The loop is transport-agnostic: it reads client frames from any stream of
//! strings and writes server frames to an mpsc channel. The WebSocket adapter
//! in `server.rs` and the integration tests both drive it the same way.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{Stream, StreamExt};
use relay_core::models::{SessionChange, SessionDelta};
use relay_core::protocol::{ServerEvent, SessionView};
use relay_core::RelayError;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tokio_util::sync::CancellationToken;

use crate::gateway::{Admission, Gateway};
use crate::pipeline::{Outbound, Pipeline};
use crate::router::{self, Flow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Unauthenticated,
    Authenticating,
    Active,
    Draining,
    Closed,
}

impl ConnectionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionPhase::Unauthenticated => "unauthenticated",
            ConnectionPhase::Authenticating => "authenticating",
            ConnectionPhase::Active => "active",
            ConnectionPhase::Draining => "draining",
            ConnectionPhase::Closed => "closed",
        }
    }

    pub fn can_transition_to(self, next: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        matches!(
            (self, next),
            (Unauthenticated, Authenticating)
                | (Authenticating, Active)
                | (Authenticating, Closed)
                | (Active, Draining)
                | (Active, Closed)
                | (Draining, Closed)
        )
    }
}

/// Validated phase transitions for one connection.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: ConnectionPhase,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Unauthenticated,
        }
    }
}

impl PhaseTracker {
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn transition(&mut self, next: ConnectionPhase) -> Result<(), RelayError> {
        if !self.phase.can_transition_to(next) {
            return Err(RelayError::invalid(
                "invalid_transition",
                format!("{} -> {}", self.phase.as_str(), next.as_str()),
            ));
        }
        tracing::debug!(from = self.phase.as_str(), to = next.as_str(), "Connection phase");
        self.phase = next;
        Ok(())
    }
}

/// Why a connection loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnected,
    ClientClosed,
    Drained,
    DrainTimeout,
    SessionExpired,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::ClientDisconnected => "client_disconnected",
            CloseReason::ClientClosed => "client_closed",
            CloseReason::Drained => "drained",
            CloseReason::DrainTimeout => "drain_timeout",
            CloseReason::SessionExpired => "session_expired",
        }
    }
}

const FAR_FUTURE: Duration = Duration::from_secs(86_400);

/// Serve one admitted connection until the client leaves, the session is
/// closed, or a drain completes.
pub async fn run_connection<S>(
    gateway: Arc<Gateway>,
    admission: Admission,
    mut phases: PhaseTracker,
    inbound: S,
    outbound: mpsc::Sender<String>,
) -> CloseReason
where
    S: Stream<Item = String> + Send + Unpin,
{
    let Admission {
        ctx,
        principal,
        session,
        client_ip,
        ..
    } = admission;
    let session_id = ctx.session_id.clone();
    let out = Outbound::new(&session_id, outbound);

    let closed = CancellationToken::new();
    let connection = gateway.register_connection(&ctx);
    let drain = connection.drain.clone();

    let results = gateway
        .dispatcher
        .subscribe_results(&session_id, closed.clone())
        .await;
    let mut results = match results {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(session_id = %session_id, "Result subscription failed: {}", e);
            out.emit(ServerEvent::error(&e, None, &ctx.correlation_id)).await;
            gateway.deregister_connection(&connection.id);
            release_session(&gateway, &session_id).await;
            return CloseReason::ClientDisconnected;
        }
    };
    let mut changes = match gateway.sessions.subscribe_changes(&session_id).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(session_id = %session_id, "Change subscription failed: {}", e);
            futures::stream::empty::<SessionDelta>().boxed()
        }
    };

    out.emit(ServerEvent::SessionCreated {
        session: SessionView::from(&session),
    })
    .await;

    let mut pipeline = Pipeline::new(gateway.clone(), ctx.clone(), principal, client_ip, out.clone())
        .with_session_config(session.config.clone());
    let mut inbound = inbound.fuse();
    let mut heartbeat = interval(gateway.config.store.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let mut drain_deadline: Option<Instant> = None;

    let reason = loop {
        if phases.phase() == ConnectionPhase::Draining && pipeline.is_idle() {
            break CloseReason::Drained;
        }
        let gap_deadline = pipeline
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
        let drain_at = drain_deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE);

        tokio::select! {
            frame = inbound.next(), if phases.phase() == ConnectionPhase::Active || phases.phase() == ConnectionPhase::Draining => {
                match frame {
                    Some(raw) => match router::handle_frame(&mut pipeline, phases.phase(), &raw).await {
                        Flow::Continue => {}
                        Flow::Close => break CloseReason::ClientClosed,
                    },
                    None => break CloseReason::ClientDisconnected,
                }
            }
            result = results.next() => {
                match result {
                    Some(result) => pipeline.on_result(result).await,
                    None => {
                        tracing::warn!(session_id = %session_id, "Result stream ended");
                        break CloseReason::ClientDisconnected;
                    }
                }
            }
            Some(delta) = changes.next() => {
                if delta.gateway_id != gateway.gateway_id {
                    forward_remote_change(&gateway, &mut pipeline, delta).await;
                }
            }
            _ = heartbeat.tick() => {
                match gateway.sessions.heartbeat(&session_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(session_id = %session_id, "Session record expired");
                        break CloseReason::SessionExpired;
                    }
                    Err(e) => tracing::warn!(session_id = %session_id, "Heartbeat failed: {}", e),
                }
            }
            _ = sleep_until(gap_deadline) => {
                pipeline.poll_gaps().await;
            }
            _ = drain.cancelled(), if phases.phase() == ConnectionPhase::Active => {
                if phases.transition(ConnectionPhase::Draining).is_ok() {
                    tracing::info!(session_id = %session_id, "Draining connection");
                    drain_deadline = Some(Instant::now() + gateway.config.timeouts.drain());
                }
            }
            _ = sleep_until(drain_at), if drain_deadline.is_some() => {
                break CloseReason::DrainTimeout;
            }
        }
    };

    let _ = phases.transition(ConnectionPhase::Closed);
    closed.cancel();
    gateway.deregister_connection(&connection.id);

    match reason {
        CloseReason::ClientClosed => {
            if let Err(e) = gateway.sessions.close(&session_id).await {
                tracing::warn!(session_id = %session_id, "Session close failed: {}", e);
            }
        }
        CloseReason::SessionExpired => {}
        _ => {
            release_session(&gateway, &session_id).await;
        }
    }
    pipeline
        .out()
        .emit(ServerEvent::SessionClosed {
            reason: reason.as_str().to_string(),
        })
        .await;
    tracing::info!(
        session_id = %session_id,
        tenant_id = %ctx.tenant_id,
        reason = reason.as_str(),
        "Connection closed"
    );
    reason
}

/// Mark the session disconnected so it can be restored elsewhere. A transient
/// store failure is retried once; after that the record stays `connected`
/// until its TTL runs out.
pub async fn release_session(gateway: &Gateway, session_id: &str) -> bool {
    let strategy = ExponentialBackoff::from_millis(10).map(jitter).take(1);
    let released = RetryIf::spawn(
        strategy,
        || gateway.sessions.mark_disconnected(session_id),
        |e: &RelayError| e.is_transient(),
    )
    .await;
    match released {
        Ok(_) => true,
        Err(RelayError::NotFound(_)) => true,
        Err(e) => {
            tracing::warn!(session_id = %session_id, "Failed to mark session disconnected: {}", e);
            false
        }
    }
}

/// Mirror another gateway's configuration change to this client.
async fn forward_remote_change(gateway: &Gateway, pipeline: &mut Pipeline, delta: SessionDelta) {
    if !matches!(delta.change, SessionChange::ConfigUpdated { .. }) {
        return;
    }
    match gateway.sessions.get(&delta.session_id).await {
        Ok(session) => {
            if !pipeline.apply_remote_config(delta.version, session.config.clone()) {
                return;
            }
            pipeline
                .out()
                .emit(ServerEvent::SessionUpdated {
                    session: SessionView::from(&session),
                })
                .await
        }
        Err(e) => tracing::debug!(session_id = %delta.session_id, "Remote change not applied: {}", e),
    }
}
