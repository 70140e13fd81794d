//! Realtime WebSocket endpoint.
//!
//! Admission runs before the upgrade, so a rejected client gets a plain HTTP
//! status with an error body and no socket is opened.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::stream::StreamExt;
use futures::{future, SinkExt};
use relay_core::context::new_correlation_id;
use relay_core::RelayError;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use crate::connection::{run_connection, ConnectionPhase, PhaseTracker};
use crate::gateway::{Admission, Gateway};
use crate::http::{error_response, HttpState};
use crate::pipeline::Outbound;
use crate::subsystems::auth::Credentials;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const OUTBOUND_CAPACITY: usize = 256;
const WRITER_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
pub struct RealtimeQuery {
    pub api_key: Option<String>,
    pub session_id: Option<String>,
}

/// Credentials from the `Authorization: Bearer` header (preferred) or the
/// `api_key` query parameter, for browsers that cannot set headers.
pub fn credentials_from(headers: &HeaderMap, query: &RealtimeQuery) -> Credentials {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string());
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    Credentials {
        api_key: bearer.or_else(|| query.api_key.clone()),
        session_id: query.session_id.clone().filter(|s| !s.is_empty()),
        client_ip,
    }
}

pub async fn realtime_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HttpState>>,
    Query(query): Query<RealtimeQuery>,
    headers: HeaderMap,
) -> Response {
    let credentials = credentials_from(&headers, &query);
    let gateway = state.gateway.clone();

    let mut phases = PhaseTracker::default();
    if let Err(e) = phases.transition(ConnectionPhase::Authenticating) {
        return error_response(&e, None);
    }
    let admission = match gateway.admit(&credentials).await {
        Ok(admission) => admission,
        Err(e) => {
            let _ = phases.transition(ConnectionPhase::Closed);
            return error_response(&e, None);
        }
    };
    if let Err(e) = phases.transition(ConnectionPhase::Active) {
        return error_response(&e, Some(&admission.ctx.correlation_id));
    }

    ws.on_upgrade(move |socket| serve_socket(socket, gateway, admission, phases))
        .into_response()
}

#[derive(Debug)]
enum Frame {
    Text(String),
    Malformed(RelayError),
    Control,
}

fn classify_frame(msg: Message) -> Frame {
    match msg {
        Message::Text(text) => Frame::Text(text),
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Frame::Text(text),
            Err(e) => Frame::Malformed(RelayError::invalid(
                "invalid_utf8",
                format!("binary frame is not UTF-8 JSON: {}", e.utf8_error()),
            )),
        },
        _ => Frame::Control,
    }
}

async fn serve_socket(socket: WebSocket, gateway: Arc<Gateway>, admission: Admission, phases: PhaseTracker) {
    let (mut ws_tx, ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        let mut ping = interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ping.tick().await;
        loop {
            tokio::select! {
                biased;

                frame = rx.recv() => match frame {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Pings and pongs are answered by the socket itself; only text reaches the
    // loop. Undecodable frames are answered here.
    let out = Outbound::new(&admission.ctx.session_id, tx.clone());
    let inbound = ws_rx
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(move |msg| {
            let out = out.clone();
            async move {
                match classify_frame(msg.ok()?) {
                    Frame::Text(text) => Some(text),
                    Frame::Malformed(e) => {
                        out.emit_error(&e, None, &new_correlation_id()).await;
                        None
                    }
                    Frame::Control => None,
                }
            }
        })
        .boxed();

    run_connection(gateway, admission, phases, inbound, tx).await;

    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_GRACE, writer).await.is_err() {
        tracing::debug!("Socket writer did not finish in time");
        abort.abort();
    }
}
