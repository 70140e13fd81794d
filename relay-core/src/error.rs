use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Errors raised by a shared-state backend (Redis or in-memory).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by a work-queue backend (NATS JetStream or in-memory).
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue backend error: {0}")]
    Backend(String),

    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Channel closed: {0}")]
    Closed(String),
}

impl QueueError {
    pub fn backend(e: impl std::fmt::Display) -> Self {
        QueueError::Backend(e.to_string())
    }
}

/// Gateway error taxonomy. Every variant maps onto a stable client-facing
/// `type` and `code`; infrastructure variants never leak their message.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Invalid request ({code}): {message}")]
    InvalidRequest {
        code: &'static str,
        message: String,
        param: Option<String>,
    },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Tenant {0} is suspended")]
    TenantSuspended(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Rate limit exceeded, retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    #[error("Overloaded: {0}")]
    Overloaded(String),

    #[error("Circuit open for dependency {0}")]
    CircuitOpen(String),

    #[error("Timed out: {operation}")]
    Timeout { operation: &'static str },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    pub fn invalid(code: &'static str, message: impl Into<String>) -> Self {
        RelayError::InvalidRequest {
            code,
            message: message.into(),
            param: None,
        }
    }

    pub fn invalid_param(
        code: &'static str,
        message: impl Into<String>,
        param: impl Into<String>,
    ) -> Self {
        RelayError::InvalidRequest {
            code,
            message: message.into(),
            param: Some(param.into()),
        }
    }

    /// Client-visible error `type`.
    pub fn error_type(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest { .. } => "invalid_request_error",
            RelayError::Authentication(_) => "authentication_error",
            RelayError::TenantSuspended(_) | RelayError::Permission(_) => "permission_error",
            RelayError::RateLimited { .. } => "rate_limit_error",
            RelayError::Timeout { .. } => "timeout_error",
            RelayError::Conflict(_) => "conflict_error",
            RelayError::NotFound(_) => "not_found_error",
            RelayError::Overloaded(_)
            | RelayError::CircuitOpen(_)
            | RelayError::Store(_)
            | RelayError::Queue(_)
            | RelayError::Database(_)
            | RelayError::Config(_)
            | RelayError::Serialization(_)
            | RelayError::Io(_) => "overloaded_error",
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest { code, .. } => code,
            RelayError::Authentication(_) => "invalid_api_key",
            RelayError::TenantSuspended(_) => "tenant_suspended",
            RelayError::Permission(_) => "insufficient_scope",
            RelayError::RateLimited { .. } => "rate_limit_exceeded",
            RelayError::Overloaded(_) => "overloaded",
            RelayError::CircuitOpen(_) => "dependency_unavailable",
            RelayError::Timeout { .. } => "deadline_exceeded",
            RelayError::Conflict(_) => "concurrent_modification",
            RelayError::NotFound(_) => "not_found",
            RelayError::Store(_) => "session_store_unavailable",
            RelayError::Queue(_) => "dispatch_unavailable",
            RelayError::Database(_) => "credential_store_unavailable",
            RelayError::Config(_) | RelayError::Serialization(_) | RelayError::Io(_) => {
                "internal_error"
            }
        }
    }

    /// Client-visible `type` for a code reported by a worker. Codes from this
    /// taxonomy keep their type; `processing_failed` is infrastructure; any
    /// other code is the worker rejecting its input.
    pub fn error_type_for_code(code: &str) -> &'static str {
        match code {
            "invalid_api_key" => "authentication_error",
            "tenant_suspended" | "insufficient_scope" => "permission_error",
            "rate_limit_exceeded" => "rate_limit_error",
            "deadline_exceeded" => "timeout_error",
            "concurrent_modification" => "conflict_error",
            "not_found" => "not_found_error",
            "overloaded"
            | "dependency_unavailable"
            | "session_store_unavailable"
            | "dispatch_unavailable"
            | "credential_store_unavailable"
            | "internal_error"
            | "processing_failed" => "overloaded_error",
            _ => "invalid_request_error",
        }
    }

    /// Whether a client may retry the same request after backing off.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RelayError::InvalidRequest { .. }
                | RelayError::Authentication(_)
                | RelayError::TenantSuspended(_)
                | RelayError::Permission(_)
                | RelayError::NotFound(_)
        )
    }

    /// Whether the error is a transient infrastructure failure worth one
    /// local retry before surfacing.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::Store(_)
                | RelayError::Queue(_)
                | RelayError::Database(_)
                | RelayError::Timeout { .. }
        )
    }

    /// Message safe to show to clients. Infrastructure details stay in logs.
    pub fn client_message(&self) -> String {
        match self {
            RelayError::Store(_)
            | RelayError::Queue(_)
            | RelayError::Database(_)
            | RelayError::Config(_)
            | RelayError::Serialization(_)
            | RelayError::Io(_) => {
                "The service is temporarily unable to process this request".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RelayError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Render the `error` object of an `error` server event.
    pub fn to_client(&self, event_id: Option<String>, correlation_id: &str) -> ErrorBody {
        let param = match self {
            RelayError::InvalidRequest { param, .. } => param.clone(),
            _ => None,
        };
        ErrorBody {
            error_type: self.error_type().to_string(),
            code: self.code().to_string(),
            message: self.client_message(),
            param,
            event_id,
            correlation_id: correlation_id.to_string(),
            retry_after_ms: self.retry_after().map(|d| d.as_millis() as u64),
        }
    }
}

/// Body of the `error` event sent to clients.
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    pub event_id: Option<String>,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

pub type Result<T> = std::result::Result<T, RelayError>;
