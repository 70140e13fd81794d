//! Relay HTTP surface
//!
//! Axum router serving the realtime WebSocket endpoint next to a small
//! operational API. Each operational endpoint is a thin handler over an inner
//! function returning `(StatusCode, Value)`, so the logic is testable without
//! going through axum dispatch.
//!
//! Endpoints:
//! - GET /v1/realtime  WebSocket upgrade (see `server.rs`)
//! - GET /health       store and queue reachability, breaker states
//! - GET /version      server version info
//! - GET /metrics      Prometheus exposition
//! - GET /sessions     live sessions, `?tenant=` filter (admin token)

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::context::new_correlation_id;
use relay_core::RelayError;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::gateway::Gateway;
use crate::server::realtime_handler;
use crate::subsystems::circuit_breaker::CircuitState;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub gateway: Arc<Gateway>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/v1/realtime", get(realtime_handler))
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/metrics", get(metrics_handler))
        .route("/sessions", get(sessions_handler))
        .with_state(state)
}

/// Serve until the shutdown signal fires, then drain live connections before
/// the listener closes.
pub async fn start_http_server(
    gateway: Arc<Gateway>,
    metrics: Option<PrometheusHandle>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", gateway.config.http.host, gateway.config.http.port);
    let state = Arc::new(HttpState {
        gateway: gateway.clone(),
        metrics,
    });

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Relay gateway listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            let remaining = gateway.drain(gateway.config.timeouts.drain()).await;
            tracing::info!(remaining, "HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

pub fn status_for(error: &RelayError) -> StatusCode {
    match error {
        RelayError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        RelayError::Authentication(_) => StatusCode::UNAUTHORIZED,
        RelayError::TenantSuspended(_) | RelayError::Permission(_) => StatusCode::FORBIDDEN,
        RelayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        RelayError::NotFound(_) => StatusCode::NOT_FOUND,
        RelayError::Conflict(_) => StatusCode::CONFLICT,
        RelayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// HTTP rendering of an error, with `Retry-After` for rate limiting.
pub fn error_response(error: &RelayError, correlation_id: Option<&str>) -> Response {
    let correlation_id = correlation_id
        .map(str::to_string)
        .unwrap_or_else(new_correlation_id);
    let body = serde_json::json!({ "error": error.to_client(None, &correlation_id) });
    let mut response = (status_for(error), Json(body)).into_response();
    if let Some(retry_after) = error.retry_after() {
        let seconds = retry_after.as_secs_f64().ceil().max(1.0) as u64;
        if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

// ============================================================================
// Inner (directly testable) functions
// ============================================================================

pub async fn health_inner(gateway: &Gateway) -> (StatusCode, serde_json::Value) {
    let store = gateway.sessions.backend().ping().await;
    let queue = gateway.dispatcher.queue().ping().await;
    let breakers = gateway.breakers.snapshot();

    let status = match (&store, &queue) {
        (Err(_), _) => "unhealthy",
        (Ok(()), Err(_)) => "degraded",
        _ if breakers.iter().any(|b| b.state != CircuitState::Closed) => "degraded",
        _ => "healthy",
    };
    let code = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let describe = |name: &str, r: Result<(), String>| match r {
        Ok(()) => serde_json::json!({ "backend": name, "ok": true }),
        Err(e) => serde_json::json!({ "backend": name, "ok": false, "error": e }),
    };

    (
        code,
        serde_json::json!({
            "status": status,
            "version": env!("CARGO_PKG_VERSION"),
            "gateway_id": gateway.gateway_id,
            "draining": gateway.is_draining(),
            "connections": gateway.connection_count(),
            "session_store": describe(gateway.sessions.backend().name(), store.map_err(|e| e.to_string())),
            "queue": describe(gateway.dispatcher.queue().name(), queue.map_err(|e| e.to_string())),
            "breakers": breakers,
        }),
    )
}

pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "relay-realtime/1",
    })
}

pub fn metrics_inner(handle: Option<&PrometheusHandle>) -> (StatusCode, String) {
    match handle {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed\n".to_string(),
        ),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionsQuery {
    #[serde(alias = "tenant_id")]
    pub tenant: Option<String>,
}

/// Live sessions. Disabled unless an admin token is configured.
pub async fn sessions_inner(
    gateway: &Gateway,
    presented_token: Option<&str>,
    tenant_id: Option<&str>,
) -> (StatusCode, serde_json::Value) {
    let Some(expected) = gateway.config.http.admin_token.as_deref() else {
        return (
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "session listing is disabled", "status": "error" }),
        );
    };
    if presented_token != Some(expected) {
        return (
            StatusCode::UNAUTHORIZED,
            serde_json::json!({ "error": "invalid admin token", "status": "error" }),
        );
    }

    match gateway.sessions.list(tenant_id).await {
        Ok(sessions) => {
            let rows: Vec<serde_json::Value> = sessions
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "id": s.id,
                        "tenant_id": s.tenant_id,
                        "gateway_id": s.gateway_id,
                        "status": s.status.as_str(),
                        "created_at": s.created_at,
                        "last_heartbeat_at": s.last_heartbeat_at,
                        "items": s.items.len(),
                    })
                })
                .collect();
            (
                StatusCode::OK,
                serde_json::json!({ "count": rows.len(), "sessions": rows }),
            )
        }
        Err(e) => {
            tracing::warn!("Session listing failed: {}", e);
            (
                status_for(&e),
                serde_json::json!({ "error": e.client_message(), "status": "error" }),
            )
        }
    }
}

// ============================================================================
// Axum handlers (thin wrappers)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.gateway).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    Json(version_inner())
}

pub async fn metrics_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = metrics_inner(state.metrics.as_ref());
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

pub async fn sessions_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<SessionsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = headers.get(ADMIN_TOKEN_HEADER).and_then(|v| v.to_str().ok());
    let (status, body) = sessions_inner(&state.gateway, token, query.tenant.as_deref()).await;
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use relay_core::config::RelayConfig;
    use relay_core::queue::MemoryQueue;
    use relay_core::store::MemoryBackend;
    use relay_core::RequestContext;
    use std::time::Duration;
    use tower::ServiceExt;

    fn make_state(admin_token: Option<&str>) -> Arc<HttpState> {
        let mut config = RelayConfig::default();
        config.http.admin_token = admin_token.map(str::to_string);
        let gateway = Gateway::new(
            config,
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryQueue::new()),
            None,
        );
        Arc::new(HttpState {
            gateway,
            metrics: None,
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // ========================================================================
    // TEST 1: version_inner is pure and returns correct fields
    // ========================================================================
    #[test]
    fn test_version_inner_pure() {
        let v = version_inner();
        assert!(v["version"].is_string());
        assert_eq!(v["protocol"], "relay-realtime/1");
    }

    // ========================================================================
    // TEST 2: error taxonomy maps onto HTTP statuses
    // ========================================================================
    #[test]
    fn test_status_for_error_types() {
        assert_eq!(
            status_for(&RelayError::Authentication("x".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&RelayError::TenantSuspended("t".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&RelayError::Overloaded("busy".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&RelayError::NotFound("s".into())),
            StatusCode::NOT_FOUND
        );
    }

    // ========================================================================
    // TEST 3: rate-limited responses carry Retry-After
    // ========================================================================
    #[tokio::test]
    async fn test_error_response_retry_after() {
        let err = RelayError::RateLimited {
            retry_after: Duration::from_millis(1500),
        };
        let response = error_response(&err, Some("corr_1"));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(body["error"]["correlation_id"], "corr_1");
        assert_eq!(body["error"]["retry_after_ms"], 1500);
    }

    // ========================================================================
    // TEST 4: health with in-memory backends is healthy
    // ========================================================================
    #[tokio::test]
    async fn test_health_inner_ok() {
        let state = make_state(None);
        let (status, body) = health_inner(&state.gateway).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["session_store"]["ok"], true);
        assert_eq!(body["draining"], false);
        assert!(body["breakers"].is_array());
    }

    // ========================================================================
    // TEST 5: session listing requires the admin token
    // ========================================================================
    #[tokio::test]
    async fn test_sessions_inner_auth() {
        let disabled = make_state(None);
        let (status, _) = sessions_inner(&disabled.gateway, Some("anything"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let state = make_state(Some("s3cret"));
        let (status, _) = sessions_inner(&state.gateway, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = sessions_inner(&state.gateway, Some("wrong"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    // ========================================================================
    // TEST 6: session listing filters by tenant
    // ========================================================================
    #[tokio::test]
    async fn test_sessions_inner_tenant_filter() {
        let state = make_state(Some("s3cret"));
        let sessions = &state.gateway.sessions;
        sessions
            .create(&RequestContext::new("acme", "sess_a"), serde_json::json!({}))
            .await
            .unwrap();
        sessions
            .create(&RequestContext::new("globex", "sess_b"), serde_json::json!({}))
            .await
            .unwrap();

        let (status, body) = sessions_inner(&state.gateway, Some("s3cret"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);

        let (_, body) = sessions_inner(&state.gateway, Some("s3cret"), Some("acme")).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["id"], "sess_a");
        assert_eq!(body["sessions"][0]["tenant_id"], "acme");
    }

    // ========================================================================
    // TEST 7: router dispatch
    // ========================================================================
    #[tokio::test]
    async fn test_router_dispatch() {
        let app = build_router(make_state(Some("s3cret")));

        let response = app
            .clone()
            .oneshot(Request::get("/version").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app
            .clone()
            .oneshot(
                Request::get("/sessions?tenant=acme")
                    .header(ADMIN_TOKEN_HEADER, "s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["count"], 0);

        let response = app
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
