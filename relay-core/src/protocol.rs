//! Client wire protocol: JSON events exchanged over the realtime socket.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorBody, RelayError};
use crate::models::{RateLimitResult, Session, WorkKind};

// ============================================================================
// Client → gateway
// ============================================================================

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate {
        event_id: Option<String>,
        session: Map<String, Value>,
    },
    #[serde(rename = "input.append")]
    InputAppend {
        event_id: Option<String>,
        /// Base64-encoded audio bytes.
        audio: String,
    },
    #[serde(rename = "input.commit")]
    InputCommit { event_id: Option<String> },
    #[serde(rename = "input.clear")]
    InputClear { event_id: Option<String> },
    #[serde(rename = "response.create")]
    ResponseCreate {
        event_id: Option<String>,
        #[serde(default)]
        response: Option<ResponseOptions>,
    },
    #[serde(rename = "response.cancel")]
    ResponseCancel {
        event_id: Option<String>,
        /// Cancels the whole session's in-flight output when absent.
        #[serde(default)]
        response_id: Option<String>,
    },
    #[serde(rename = "session.close")]
    SessionClose { event_id: Option<String> },
}

pub const CLIENT_EVENT_TYPES: &[&str] = &[
    "session.update",
    "input.append",
    "input.commit",
    "input.clear",
    "response.create",
    "response.cancel",
    "session.close",
];

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ResponseOptions {
    pub instructions: Option<String>,
    /// `["text"]` skips synthesis; defaults to text and audio.
    pub modalities: Option<Vec<Modality>>,
}

impl ClientEvent {
    pub fn event_id(&self) -> Option<&str> {
        match self {
            ClientEvent::SessionUpdate { event_id, .. }
            | ClientEvent::InputAppend { event_id, .. }
            | ClientEvent::InputCommit { event_id }
            | ClientEvent::InputClear { event_id }
            | ClientEvent::ResponseCreate { event_id, .. }
            | ClientEvent::ResponseCancel { event_id, .. }
            | ClientEvent::SessionClose { event_id } => event_id.as_deref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAppend { .. } => "input.append",
            ClientEvent::InputCommit { .. } => "input.commit",
            ClientEvent::InputClear { .. } => "input.clear",
            ClientEvent::ResponseCreate { .. } => "response.create",
            ClientEvent::ResponseCancel { .. } => "response.cancel",
            ClientEvent::SessionClose { .. } => "session.close",
        }
    }
}

/// A client frame that failed to parse, with whatever `event_id` could be
/// recovered for the error reply.
#[derive(Debug)]
pub struct Rejected {
    pub event_id: Option<String>,
    pub error: RelayError,
}

/// Parse one text frame. Nothing is mutated on failure.
pub fn parse_client_event(raw: &str, max_bytes: usize) -> Result<ClientEvent, Rejected> {
    if raw.len() > max_bytes {
        return Err(Rejected {
            event_id: None,
            error: RelayError::invalid(
                "event_too_large",
                format!("event exceeds {} bytes", max_bytes),
            ),
        });
    }

    let value: Value = serde_json::from_str(raw).map_err(|e| Rejected {
        event_id: None,
        error: RelayError::invalid("invalid_json", format!("malformed JSON: {}", e)),
    })?;

    let event_id = value
        .get("event_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let reject = |error: RelayError| Rejected {
        event_id: event_id.clone(),
        error,
    };

    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) => kind,
        None => {
            return Err(reject(RelayError::invalid_param(
                "missing_type",
                "event has no string `type` field",
                "type",
            )))
        }
    };
    if !CLIENT_EVENT_TYPES.contains(&kind) {
        return Err(reject(RelayError::invalid_param(
            "unknown_event",
            format!("unknown event type '{}'", kind),
            "type",
        )));
    }

    let event: ClientEvent = serde_json::from_value(value.clone())
        .map_err(|e| reject(RelayError::invalid("invalid_event", e.to_string())))?;

    if let ClientEvent::SessionUpdate { session, .. } = &event {
        validate_session_patch(session).map_err(reject)?;
    }
    Ok(event)
}

/// Check the session fields the gateway interprets. Everything else in the
/// configuration blob is passed through untouched.
pub fn validate_session_patch(patch: &Map<String, Value>) -> Result<(), RelayError> {
    let number_in = |key: &str, min: f64, max: f64| -> Result<(), RelayError> {
        match patch.get(key) {
            None | Some(Value::Null) => Ok(()),
            Some(v) => match v.as_f64() {
                Some(n) if (min..=max).contains(&n) => Ok(()),
                _ => Err(RelayError::invalid_param(
                    "invalid_value",
                    format!("{} must be a number between {} and {}", key, min, max),
                    format!("session.{}", key),
                )),
            },
        }
    };
    number_in("temperature", 0.0, 2.0)?;
    number_in("speed", 0.25, 4.0)?;

    for key in ["voice", "model", "instructions"] {
        match patch.get(key) {
            None | Some(Value::Null) | Some(Value::String(_)) => {}
            Some(_) => {
                return Err(RelayError::invalid_param(
                    "invalid_type",
                    format!("{} must be a string", key),
                    format!("session.{}", key),
                ))
            }
        }
    }
    Ok(())
}

// ============================================================================
// Gateway → client
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Audio,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionView {
    pub id: String,
    pub status: String,
    pub config: Value,
    pub items: usize,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            status: session.status.as_str().to_string(),
            config: session.config.clone(),
            items: session.items.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitView {
    pub name: String,
    pub limit: u64,
    pub remaining: u64,
    pub reset_seconds: f64,
}

impl RateLimitView {
    pub fn from_result(result: &RateLimitResult, max_requests: u64, max_units: u64) -> Vec<Self> {
        let reset = (result.reset_time - chrono::Utc::now())
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        vec![
            RateLimitView {
                name: "requests".to_string(),
                limit: max_requests,
                remaining: result.requests_remaining,
                reset_seconds: reset,
            },
            RateLimitView {
                name: "units".to_string(),
                limit: max_units,
                remaining: result.units_remaining,
                reset_seconds: reset,
            },
        ]
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartialReason {
    GapTimeout,
    BufferOverflow,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionView },
    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionView },
    #[serde(rename = "input.committed")]
    InputCommitted { item_id: String, audio_bytes: usize },
    #[serde(rename = "input.cleared")]
    InputCleared {},
    #[serde(rename = "response.created")]
    ResponseCreated { response_id: String },
    #[serde(rename = "response.output.delta")]
    ResponseOutputDelta {
        response_id: String,
        modality: Modality,
        /// Text, or base64 audio.
        delta: String,
        sequence: u64,
        chunk: u32,
    },
    #[serde(rename = "response.output.done")]
    ResponseOutputDone {
        response_id: String,
        status: String,
        text: String,
    },
    #[serde(rename = "response.cancelled")]
    ResponseCancelled { response_id: String },
    #[serde(rename = "error")]
    Error { error: ErrorBody },
    #[serde(rename = "rate_limits.updated")]
    RateLimitsUpdated { rate_limits: Vec<RateLimitView> },
    #[serde(rename = "partial_result")]
    PartialResult {
        work_kind: WorkKind,
        response_id: Option<String>,
        missing_sequence: u64,
        reason: PartialReason,
    },
    #[serde(rename = "session.closed")]
    SessionClosed { reason: String },
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::SessionCreated { .. } => "session.created",
            ServerEvent::SessionUpdated { .. } => "session.updated",
            ServerEvent::InputCommitted { .. } => "input.committed",
            ServerEvent::InputCleared {} => "input.cleared",
            ServerEvent::ResponseCreated { .. } => "response.created",
            ServerEvent::ResponseOutputDelta { .. } => "response.output.delta",
            ServerEvent::ResponseOutputDone { .. } => "response.output.done",
            ServerEvent::ResponseCancelled { .. } => "response.cancelled",
            ServerEvent::Error { .. } => "error",
            ServerEvent::RateLimitsUpdated { .. } => "rate_limits.updated",
            ServerEvent::PartialResult { .. } => "partial_result",
            ServerEvent::SessionClosed { .. } => "session.closed",
        }
    }

    pub fn error(error: &RelayError, event_id: Option<String>, correlation_id: &str) -> Self {
        ServerEvent::Error {
            error: error.to_client(event_id, correlation_id),
        }
    }
}

/// Wire frame: every server event carries a fresh `event_id` and the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerEnvelope {
    pub event_id: String,
    pub session_id: String,
    #[serde(flatten)]
    pub event: ServerEvent,
}

impl ServerEnvelope {
    pub fn new(session_id: impl Into<String>, event: ServerEvent) -> Self {
        Self {
            event_id: crate::context::new_event_id(),
            session_id: session_id.into(),
            event,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
