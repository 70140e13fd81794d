use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::QueueError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Stt,
    Llm,
    Tts,
}

impl WorkKind {
    pub const ALL: [WorkKind; 3] = [WorkKind::Stt, WorkKind::Llm, WorkKind::Tts];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkKind::Stt => "stt",
            WorkKind::Llm => "llm",
            WorkKind::Tts => "tts",
        }
    }
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkPayload {
    /// Committed user audio to transcribe.
    Audio { audio: Bytes, format: String },
    /// Conversation to run inference on.
    Prompt {
        instructions: Option<String>,
        messages: Vec<PromptMessage>,
        config: serde_json::Value,
    },
    /// Text to synthesize.
    Text {
        text: String,
        voice: Option<String>,
        config: serde_json::Value,
    },
}

/// A unit of work handed to an external worker pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    pub session_id: String,
    pub tenant_id: String,
    pub work_kind: WorkKind,
    pub sequence: u64,
    pub correlation_id: String,
    #[serde(default)]
    pub response_id: Option<String>,
    pub payload: WorkPayload,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Intermediate output; more chunks follow.
    Delta,
    Completed,
    Failed,
    Cancelled,
}

impl ResultStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ResultStatus::Delta)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultPayload {
    Transcript { text: String },
    Text { text: String },
    Audio { audio: Bytes },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkFailure {
    pub code: String,
    pub message: String,
}

/// Output event published by a worker for a work item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkResult {
    pub correlation_id: String,
    pub session_id: String,
    pub work_kind: WorkKind,
    pub sequence: u64,
    /// Position of this chunk within the item's output, starting at 0.
    #[serde(default)]
    pub chunk: u32,
    pub status: ResultStatus,
    #[serde(default)]
    pub payload: Option<ResultPayload>,
    #[serde(default)]
    pub error: Option<WorkFailure>,
}

impl WorkResult {
    pub fn for_item(item: &WorkItem, chunk: u32, status: ResultStatus) -> Self {
        Self {
            correlation_id: item.correlation_id.clone(),
            session_id: item.session_id.clone(),
            work_kind: item.work_kind,
            sequence: item.sequence,
            chunk,
            status,
            payload: None,
            error: None,
        }
    }

    pub fn with_payload(mut self, payload: ResultPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Terminal failure emitted after the item exhausted its deliveries.
    pub fn processing_failed(item: &WorkItem, attempts: u32) -> Self {
        let mut result = Self::for_item(item, u32::MAX, ResultStatus::Failed);
        result.error = Some(WorkFailure {
            code: "processing_failed".to_string(),
            message: format!("work item dead-lettered after {} deliveries", attempts),
        });
        result
    }

    pub fn key(&self) -> (u64, u32) {
        (self.sequence, self.chunk)
    }
}

/// Best-effort cancellation broadcast on a work kind's control channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancelSignal {
    pub session_id: String,
    pub response_id: Option<String>,
    pub issued_at: DateTime<Utc>,
}

/// Encode a queue message as MessagePack with named fields.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, QueueError> {
    Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, QueueError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> WorkItem {
        WorkItem {
            session_id: "sess_1".into(),
            tenant_id: "tenant".into(),
            work_kind: WorkKind::Stt,
            sequence: 7,
            correlation_id: "corr_1".into(),
            response_id: None,
            payload: WorkPayload::Audio {
                audio: Bytes::from_static(&[1, 2, 3, 4]),
                format: "pcm16".into(),
            },
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn test_work_item_msgpack_keeps_audio_bytes() {
        let original = item();
        let bytes = encode(&original).unwrap();
        let decoded: WorkItem = decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result: Result<WorkItem, _> = decode(b"not msgpack");
        assert!(matches!(result, Err(QueueError::Decode(_))));
    }

    #[test]
    fn test_processing_failed_is_terminal_and_echoes_correlation() {
        let result = WorkResult::processing_failed(&item(), 4);
        assert!(result.status.is_terminal());
        assert_eq!(result.correlation_id, "corr_1");
        assert_eq!(result.sequence, 7);
        assert_eq!(result.error.unwrap().code, "processing_failed");
    }
}
