//! Per-connection speech pipeline.
//!
//! Turns client events into work items and worker results into server
//! events:
//! - committed audio becomes an `stt` item; its transcript is appended to the
//!   conversation and, with `auto_response`, starts a response
//! - a response is one `llm` item plus one `tts` item per text delta
//! - a response is done once its `llm` item and every `tts` item are terminal
//!
//! Results pass through the per-kind reorder buffers first. Releases are
//! queued and processed in a loop, since handling one may submit new work.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use metrics::counter;
use relay_core::context::{new_correlation_id, new_item_id, new_response_id};
use relay_core::error::ErrorBody;
use relay_core::models::{
    ConversationItem, ItemRole, PromptMessage, ResultPayload, ResultStatus, WorkFailure, WorkItem,
    WorkKind, WorkPayload, WorkResult,
};
use relay_core::protocol::{Modality, ResponseOptions, ServerEnvelope, ServerEvent, SessionView};
use relay_core::{RelayError, RequestContext};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::gateway::{CancelTarget, Gateway};
use crate::subsystems::auth::Principal;
use crate::subsystems::ordering::{KindBuffers, Release};

/// Serialises server events onto the connection's writer channel.
#[derive(Clone)]
pub struct Outbound {
    session_id: Arc<str>,
    tx: mpsc::Sender<String>,
}

impl Outbound {
    pub fn new(session_id: &str, tx: mpsc::Sender<String>) -> Self {
        Self {
            session_id: Arc::from(session_id),
            tx,
        }
    }

    pub async fn emit(&self, event: ServerEvent) {
        let kind = event.kind();
        let frame = match ServerEnvelope::new(self.session_id.as_ref(), event).to_json() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(session_id = %self.session_id, "Failed to encode {}: {}", kind, e);
                return;
            }
        };
        if self.tx.send(frame).await.is_err() {
            tracing::debug!(session_id = %self.session_id, "Client writer gone, dropping {}", kind);
            return;
        }
        counter!("relay_server_events_total", "type" => kind).increment(1);
    }

    pub async fn emit_error(&self, error: &RelayError, event_id: Option<String>, correlation_id: &str) {
        self.emit(ServerEvent::error(error, event_id, correlation_id)).await;
    }
}

enum Owner {
    Commit { item_id: String, transcript: String },
    Response { response_id: String },
}

struct ResponseState {
    audio: bool,
    voice: Option<String>,
    llm_done: bool,
    tts_pending: BTreeSet<u64>,
    text: String,
    failed: bool,
    incomplete: bool,
}

pub struct Pipeline {
    gateway: Arc<Gateway>,
    ctx: RequestContext,
    principal: Principal,
    client_ip: Option<String>,
    out: Outbound,
    config: Value,
    /// Store version of the newest remote snapshot applied to `config`.
    remote_version: u64,
    audio: Vec<u8>,
    buffers: KindBuffers,
    owners: HashMap<(WorkKind, u64), Owner>,
    responses: HashMap<String, ResponseState>,
    last_sequence: HashMap<WorkKind, u64>,
    backlog: VecDeque<(WorkKind, Release)>,
}

impl Pipeline {
    pub fn new(
        gateway: Arc<Gateway>,
        ctx: RequestContext,
        principal: Principal,
        client_ip: Option<String>,
        out: Outbound,
    ) -> Self {
        let buffers = KindBuffers::new(&gateway.config.ordering);
        Self {
            gateway,
            ctx,
            principal,
            client_ip,
            out,
            config: Value::Object(Map::new()),
            remote_version: 0,
            audio: Vec::new(),
            buffers,
            owners: HashMap::new(),
            responses: HashMap::new(),
            last_sequence: HashMap::new(),
            backlog: VecDeque::new(),
        }
    }

    /// Seed the cached session configuration from an admitted session.
    pub fn with_session_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Adopt a configuration written through another gateway. Snapshots not
    /// newer than the last one applied are ignored.
    pub fn apply_remote_config(&mut self, version: u64, config: Value) -> bool {
        if version <= self.remote_version {
            return false;
        }
        self.remote_version = version;
        self.config = config;
        true
    }

    pub fn session_config(&self) -> &Value {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn ctx(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn client_ip(&self) -> Option<&str> {
        self.client_ip.as_deref()
    }

    pub fn out(&self) -> &Outbound {
        &self.out
    }

    pub fn buffered_audio(&self) -> usize {
        self.audio.len()
    }

    /// No work item of this connection is waiting for a terminal result.
    pub fn is_idle(&self) -> bool {
        self.buffers.is_idle()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.buffers.next_deadline()
    }

    // ========================================================================
    // Client events
    // ========================================================================

    pub async fn update_session(&mut self, patch: &Map<String, Value>) -> Result<(), RelayError> {
        let session = self.gateway.sessions.update_config(&self.ctx.session_id, patch).await?;
        self.config = session.config.clone();
        self.out
            .emit(ServerEvent::SessionUpdated {
                session: SessionView::from(&session),
            })
            .await;
        Ok(())
    }

    pub fn append_audio(&mut self, encoded: &str) -> Result<(), RelayError> {
        let decoded = STANDARD.decode(encoded).map_err(|e| {
            RelayError::invalid_param("invalid_audio", format!("audio is not valid base64: {}", e), "audio")
        })?;
        let limit = self.gateway.config.protocol.max_audio_buffer_bytes;
        if self.audio.len() + decoded.len() > limit {
            return Err(RelayError::invalid_param(
                "input_buffer_full",
                format!("audio buffer would exceed {} bytes, commit or clear it first", limit),
                "audio",
            ));
        }
        self.audio.extend_from_slice(&decoded);
        Ok(())
    }

    pub async fn clear_audio(&mut self) {
        self.audio.clear();
        self.out.emit(ServerEvent::InputCleared {}).await;
    }

    pub async fn commit_audio(&mut self) -> Result<(), RelayError> {
        if self.audio.is_empty() {
            return Err(RelayError::invalid(
                "input_buffer_empty",
                "no audio has been appended since the last commit",
            ));
        }
        let audio = Bytes::from(std::mem::take(&mut self.audio));
        let audio_bytes = audio.len();
        let format = self
            .config
            .get("input_audio_format")
            .and_then(Value::as_str)
            .unwrap_or("pcm16")
            .to_string();
        let item_id = new_item_id();
        self.submit(
            WorkKind::Stt,
            None,
            WorkPayload::Audio { audio, format },
            Owner::Commit {
                item_id: item_id.clone(),
                transcript: String::new(),
            },
        )
        .await?;
        self.out
            .emit(ServerEvent::InputCommitted {
                item_id,
                audio_bytes,
            })
            .await;
        self.drain_backlog().await;
        Ok(())
    }

    pub async fn create_response(&mut self, options: Option<ResponseOptions>) -> Result<String, RelayError> {
        let response_id = self.start_response(options).await?;
        self.drain_backlog().await;
        Ok(response_id)
    }

    /// Register the response and submit its `llm` item. Does not process the
    /// release backlog, so it can run while the backlog is being drained.
    async fn start_response(&mut self, options: Option<ResponseOptions>) -> Result<String, RelayError> {
        let options = options.unwrap_or_default();
        let session = self.gateway.sessions.get(&self.ctx.session_id).await?;
        self.config = session.config.clone();

        let messages: Vec<PromptMessage> = session
            .items
            .iter()
            .map(|item| PromptMessage {
                role: match item.role {
                    ItemRole::User => "user",
                    ItemRole::Assistant => "assistant",
                    ItemRole::System => "system",
                }
                .to_string(),
                content: item.content.clone(),
            })
            .collect();
        let instructions = options.instructions.clone().or_else(|| {
            session
                .config
                .get("instructions")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        let audio = options
            .modalities
            .as_ref()
            .map(|m| m.contains(&Modality::Audio))
            .unwrap_or(true);

        let response_id = new_response_id();
        self.responses.insert(
            response_id.clone(),
            ResponseState {
                audio,
                voice: session.config.get("voice").and_then(Value::as_str).map(str::to_string),
                llm_done: false,
                tts_pending: BTreeSet::new(),
                text: String::new(),
                failed: false,
                incomplete: false,
            },
        );
        let submitted = self
            .submit(
                WorkKind::Llm,
                Some(&response_id),
                WorkPayload::Prompt {
                    instructions,
                    messages,
                    config: session.config.clone(),
                },
                Owner::Response {
                    response_id: response_id.clone(),
                },
            )
            .await;
        if let Err(e) = submitted {
            self.responses.remove(&response_id);
            return Err(e);
        }
        self.out
            .emit(ServerEvent::ResponseCreated {
                response_id: response_id.clone(),
            })
            .await;
        Ok(response_id)
    }

    /// Cancel one response, or everything in flight when `response_id` is
    /// absent. Later output for the cancelled scope is never forwarded.
    pub async fn cancel(&mut self, response_id: Option<String>) -> Result<(), RelayError> {
        let (target, responses) = match response_id {
            Some(id) => {
                if !self.responses.contains_key(&id) {
                    return Err(RelayError::NotFound(format!("response {}", id)));
                }
                (CancelTarget::Response(id.clone()), vec![id])
            }
            None => (
                CancelTarget::Session(self.last_sequence.clone()),
                self.responses.keys().cloned().collect(),
            ),
        };
        let session_wide = matches!(target, CancelTarget::Session(_));

        if let Err(e) = self.gateway.cancel(&self.ctx, &target).await {
            // Workers will run to completion; their output is still suppressed here.
            tracing::warn!(session_id = %self.ctx.session_id, "Cancellation flag not stored: {}", e);
        }

        let mut forgotten: HashMap<WorkKind, Vec<u64>> = HashMap::new();
        self.owners.retain(|(kind, seq), owner| {
            let drop = match owner {
                Owner::Response { response_id } => responses.contains(response_id),
                Owner::Commit { .. } => session_wide,
            };
            if drop {
                forgotten.entry(*kind).or_default().push(*seq);
            }
            !drop
        });
        let now = Instant::now();
        for (kind, sequences) in forgotten {
            let released = self.buffers.get_mut(kind).forget(&sequences, now);
            self.backlog.extend(released.into_iter().map(|r| (kind, r)));
        }
        for id in responses {
            self.responses.remove(&id);
            self.out
                .emit(ServerEvent::ResponseCancelled { response_id: id })
                .await;
        }
        self.drain_backlog().await;
        Ok(())
    }

    // ========================================================================
    // Worker results
    // ========================================================================

    pub async fn on_result(&mut self, result: WorkResult) {
        let kind = result.work_kind;
        let released = self.buffers.get_mut(kind).insert(result, Instant::now());
        self.backlog.extend(released.into_iter().map(|r| (kind, r)));
        self.drain_backlog().await;
    }

    pub async fn poll_gaps(&mut self) {
        let released = self.buffers.poll(Instant::now());
        self.backlog.extend(released);
        self.drain_backlog().await;
    }

    async fn drain_backlog(&mut self) {
        while let Some((kind, release)) = self.backlog.pop_front() {
            match release {
                Release::Deliver(result) => self.deliver(kind, result).await,
                Release::Skipped { sequence, reason } => {
                    let owner = self.owners.remove(&(kind, sequence));
                    let response_id = match &owner {
                        Some(Owner::Response { response_id }) => Some(response_id.clone()),
                        _ => None,
                    };
                    self.out
                        .emit(ServerEvent::PartialResult {
                            work_kind: kind,
                            response_id: response_id.clone(),
                            missing_sequence: sequence,
                            reason,
                        })
                        .await;
                    if let Some(id) = response_id {
                        self.settle(&id, kind, sequence, true).await;
                    }
                }
            }
        }
    }

    async fn deliver(&mut self, kind: WorkKind, result: WorkResult) {
        let key = (kind, result.sequence);
        let response_id = match self.owners.get_mut(&key) {
            None => return,
            Some(Owner::Commit { transcript, .. }) => {
                if let Some(ResultPayload::Transcript { text } | ResultPayload::Text { text }) = &result.payload {
                    transcript.push_str(text);
                }
                None
            }
            Some(Owner::Response { response_id }) => Some(response_id.clone()),
        };
        if result.status.is_terminal() {
            let owner = self.owners.remove(&key);
            if let Some(Owner::Commit { item_id, transcript }) = owner {
                self.finish_commit(item_id, transcript, &result).await;
            }
        }
        let Some(response_id) = response_id else { return };
        if !self.responses.contains_key(&response_id) {
            return;
        }

        match (kind, result.status) {
            (WorkKind::Llm, ResultStatus::Delta) => self.on_text_delta(&response_id, &result).await,
            (WorkKind::Tts, ResultStatus::Delta) => {
                if let Some(ResultPayload::Audio { audio }) = &result.payload {
                    self.out
                        .emit(ServerEvent::ResponseOutputDelta {
                            response_id: response_id.clone(),
                            modality: Modality::Audio,
                            delta: STANDARD.encode(audio),
                            sequence: result.sequence,
                            chunk: result.chunk,
                        })
                        .await;
                }
            }
            (_, ResultStatus::Failed) => {
                self.emit_failure(result.error.as_ref(), &result.correlation_id).await;
                if let Some(state) = self.responses.get_mut(&response_id) {
                    state.failed = true;
                }
                self.settle(&response_id, kind, result.sequence, false).await;
            }
            (_, ResultStatus::Completed | ResultStatus::Cancelled) => {
                self.settle(&response_id, kind, result.sequence, false).await;
            }
            (WorkKind::Stt, ResultStatus::Delta) => {}
        }
    }

    async fn finish_commit(&mut self, item_id: String, transcript: String, result: &WorkResult) {
        match result.status {
            ResultStatus::Completed => {}
            ResultStatus::Failed => {
                self.emit_failure(result.error.as_ref(), &result.correlation_id).await;
                return;
            }
            _ => return,
        }
        let transcript = transcript.trim().to_string();
        if transcript.is_empty() {
            return;
        }
        let item = ConversationItem {
            id: item_id,
            role: ItemRole::User,
            content: transcript,
            created_at: Utc::now(),
        };
        if let Err(e) = self.gateway.sessions.append_item(&self.ctx.session_id, item).await {
            self.out.emit_error(&e, None, &result.correlation_id).await;
            return;
        }
        if self.gateway.config.protocol.auto_response {
            if let Err(e) = self.start_response(None).await {
                self.out.emit_error(&e, None, &result.correlation_id).await;
            }
        }
    }

    async fn on_text_delta(&mut self, response_id: &str, result: &WorkResult) {
        let Some(ResultPayload::Text { text }) = &result.payload else {
            return;
        };
        self.out
            .emit(ServerEvent::ResponseOutputDelta {
                response_id: response_id.to_string(),
                modality: Modality::Text,
                delta: text.clone(),
                sequence: result.sequence,
                chunk: result.chunk,
            })
            .await;

        let (audio, voice) = match self.responses.get_mut(response_id) {
            Some(state) => {
                state.text.push_str(text);
                (state.audio, state.voice.clone())
            }
            None => return,
        };
        if !audio || text.trim().is_empty() {
            return;
        }
        let submitted = self
            .submit(
                WorkKind::Tts,
                Some(response_id),
                WorkPayload::Text {
                    text: text.clone(),
                    voice,
                    config: self.config.clone(),
                },
                Owner::Response {
                    response_id: response_id.to_string(),
                },
            )
            .await;
        match submitted {
            Ok(sequence) => {
                if let Some(state) = self.responses.get_mut(response_id) {
                    state.tts_pending.insert(sequence);
                }
            }
            Err(e) => {
                self.out.emit_error(&e, None, &result.correlation_id).await;
                if let Some(state) = self.responses.get_mut(response_id) {
                    state.incomplete = true;
                }
            }
        }
    }

    /// Record a terminal outcome for one of the response's items and finish
    /// the response once nothing is outstanding.
    async fn settle(&mut self, response_id: &str, kind: WorkKind, sequence: u64, skipped: bool) {
        let Some(state) = self.responses.get_mut(response_id) else {
            return;
        };
        match kind {
            WorkKind::Llm => state.llm_done = true,
            WorkKind::Tts => {
                state.tts_pending.remove(&sequence);
            }
            WorkKind::Stt => {}
        }
        if skipped {
            state.incomplete = true;
        }
        if !state.llm_done || !state.tts_pending.is_empty() {
            return;
        }
        let Some(state) = self.responses.remove(response_id) else {
            return;
        };
        let status = if state.failed {
            "failed"
        } else if state.incomplete {
            "incomplete"
        } else {
            "completed"
        };
        if !state.text.is_empty() {
            let item = ConversationItem {
                id: new_item_id(),
                role: ItemRole::Assistant,
                content: state.text.clone(),
                created_at: Utc::now(),
            };
            if let Err(e) = self.gateway.sessions.append_item(&self.ctx.session_id, item).await {
                tracing::warn!(session_id = %self.ctx.session_id, "Failed to store assistant turn: {}", e);
            }
        }
        counter!("relay_responses_total", "status" => status).increment(1);
        self.out
            .emit(ServerEvent::ResponseOutputDone {
                response_id: response_id.to_string(),
                status: status.to_string(),
                text: state.text,
            })
            .await;
    }

    async fn emit_failure(&self, failure: Option<&WorkFailure>, correlation_id: &str) {
        let (code, message) = match failure {
            Some(f) => (f.code.clone(), f.message.clone()),
            None => ("processing_failed".to_string(), "work item failed".to_string()),
        };
        self.out
            .emit(ServerEvent::Error {
                error: ErrorBody {
                    error_type: RelayError::error_type_for_code(&code).to_string(),
                    code,
                    message,
                    param: None,
                    event_id: None,
                    correlation_id: correlation_id.to_string(),
                    retry_after_ms: None,
                },
            })
            .await;
    }

    // ========================================================================
    // Submission
    // ========================================================================

    async fn submit(
        &mut self,
        kind: WorkKind,
        response_id: Option<&str>,
        payload: WorkPayload,
        owner: Owner,
    ) -> Result<u64, RelayError> {
        let sequence = self
            .gateway
            .sessions
            .next_sequence(&self.ctx.session_id, kind)
            .await?;
        let item = WorkItem {
            session_id: self.ctx.session_id.clone(),
            tenant_id: self.ctx.tenant_id.clone(),
            work_kind: kind,
            sequence,
            correlation_id: new_correlation_id(),
            response_id: response_id.map(str::to_string),
            payload,
            enqueued_at: Utc::now(),
        };

        self.buffers.get_mut(kind).register(sequence);
        self.owners.insert((kind, sequence), owner);
        self.last_sequence.insert(kind, sequence);

        match self.gateway.providers.submit(&item).await {
            Ok(provider) => {
                tracing::debug!(
                    session_id = %item.session_id,
                    correlation_id = %item.correlation_id,
                    request_correlation_id = %self.ctx.correlation_id,
                    kind = %kind,
                    sequence,
                    provider = %provider,
                    "Work submitted"
                );
                Ok(sequence)
            }
            Err(e) => {
                self.owners.remove(&(kind, sequence));
                let released = self.buffers.get_mut(kind).forget(&[sequence], Instant::now());
                self.backlog.extend(released.into_iter().map(|r| (kind, r)));
                Err(e)
            }
        }
    }

    /// Tag subsequent work with the correlation id of the event being handled.
    pub fn set_request_context(&mut self, ctx: RequestContext) {
        self.ctx = ctx;
    }
}
