//! Provider chains per capability.
//!
//! Each capability maps to an ordered list of providers. `Providers::submit`
//! tries them in priority order through the circuit breaker registry, so a
//! provider whose breaker is open is skipped without being called.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use relay_core::config::{ProviderConfig, ProviderKind, ProvidersConfig};
use relay_core::models::{ResultPayload, WorkFailure, WorkItem, WorkKind, WorkPayload};
use relay_core::RelayError;

use super::circuit_breaker::BreakerRegistry;
use super::dispatcher::{Dispatcher, WorkHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Transcribe,
    Generate,
    Synthesize,
}

impl Capability {
    pub fn work_kind(self) -> WorkKind {
        match self {
            Capability::Transcribe => WorkKind::Stt,
            Capability::Generate => WorkKind::Llm,
            Capability::Synthesize => WorkKind::Tts,
        }
    }

    pub fn for_kind(kind: WorkKind) -> Self {
        match kind {
            WorkKind::Stt => Capability::Transcribe,
            WorkKind::Llm => Capability::Generate,
            WorkKind::Tts => Capability::Synthesize,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Transcribe => "transcribe",
            Capability::Generate => "generate",
            Capability::Synthesize => "synthesize",
        }
    }
}

/// A way of getting work done for a capability.
#[derive(Debug, Clone, PartialEq)]
pub enum Provider {
    /// External workers consuming `relay.work.{pool}.*`.
    WorkerPool { name: String, pool: String },
    /// In-process echo responder.
    Loopback { name: String, chunk_delay: Duration },
}

impl Provider {
    pub fn from_config(config: &ProviderConfig, capability: Capability) -> Self {
        match config.kind {
            ProviderKind::WorkerPool => Provider::WorkerPool {
                name: config.name.clone(),
                pool: config
                    .pool
                    .clone()
                    .unwrap_or_else(|| capability.work_kind().as_str().to_string()),
            },
            ProviderKind::Loopback => Provider::Loopback {
                name: config.name.clone(),
                chunk_delay: Duration::from_millis(config.chunk_delay_ms),
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Provider::WorkerPool { name, .. } | Provider::Loopback { name, .. } => name,
        }
    }

    pub fn pool(&self) -> Option<&str> {
        match self {
            Provider::WorkerPool { pool, .. } => Some(pool),
            Provider::Loopback { .. } => None,
        }
    }

    /// Hand the item over. Returns once the provider has accepted it; output
    /// arrives later on the session's result subject.
    pub async fn submit(&self, dispatcher: &Arc<Dispatcher>, item: &WorkItem) -> Result<(), RelayError> {
        match self {
            Provider::WorkerPool { pool, .. } => dispatcher.enqueue_to(pool, item).await,
            Provider::Loopback { chunk_delay, .. } => {
                let dispatcher = dispatcher.clone();
                let handler = EchoHandler {
                    chunk_delay: *chunk_delay,
                };
                let item = item.clone();
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.process(&handler, &item).await {
                        tracing::warn!(
                            session_id = %item.session_id,
                            correlation_id = %item.correlation_id,
                            "Loopback processing failed: {}",
                            e
                        );
                    }
                });
                Ok(())
            }
        }
    }
}

pub struct Providers {
    dispatcher: Arc<Dispatcher>,
    breakers: Arc<BreakerRegistry>,
    chains: HashMap<Capability, Vec<Provider>>,
}

impl Providers {
    pub fn from_config(
        config: &ProvidersConfig,
        dispatcher: Arc<Dispatcher>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        let chain = |capability: Capability, list: &[ProviderConfig]| {
            (
                capability,
                list.iter()
                    .map(|p| Provider::from_config(p, capability))
                    .collect::<Vec<_>>(),
            )
        };
        let chains = HashMap::from([
            chain(Capability::Transcribe, &config.transcribe),
            chain(Capability::Generate, &config.generate),
            chain(Capability::Synthesize, &config.synthesize),
        ]);
        Self {
            dispatcher,
            breakers,
            chains,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn chain(&self, capability: Capability) -> &[Provider] {
        self.chains.get(&capability).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Worker pools serving `kind`, for cancellation broadcasts.
    pub fn pools_for(&self, kind: WorkKind) -> Vec<String> {
        self.chain(Capability::for_kind(kind))
            .iter()
            .filter_map(|p| p.pool().map(str::to_string))
            .collect()
    }

    /// Submit to the first provider that accepts the item. Returns the name of
    /// the provider used.
    pub async fn submit(&self, item: &WorkItem) -> Result<String, RelayError> {
        let capability = Capability::for_kind(item.work_kind);
        for provider in self.chain(capability) {
            let outcome = self
                .breakers
                .call(provider.name(), || provider.submit(&self.dispatcher, item))
                .await;
            match outcome {
                Ok(()) => return Ok(provider.name().to_string()),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        provider = %provider.name(),
                        capability = capability.as_str(),
                        correlation_id = %item.correlation_id,
                        "Provider unavailable, trying next: {}",
                        e
                    );
                }
            }
        }
        Err(RelayError::Overloaded(format!(
            "no provider available for {}",
            capability.as_str()
        )))
    }
}

// ============================================================================
// Loopback responder
// ============================================================================

/// Deterministic stand-in for real workers:
/// - stt: the audio bytes read back as UTF-8 text
/// - llm: echoes the last user message word by word
/// - tts: the text bytes as one audio chunk
pub struct EchoHandler {
    pub chunk_delay: Duration,
}

impl EchoHandler {
    fn chunks(item: &WorkItem) -> Vec<Result<ResultPayload, WorkFailure>> {
        match &item.payload {
            WorkPayload::Audio { audio, .. } => {
                let text = match std::str::from_utf8(audio) {
                    Ok(s) if !s.trim().is_empty() => s.trim().to_string(),
                    _ => format!("[{} bytes of audio]", audio.len()),
                };
                vec![Ok(ResultPayload::Transcript { text })]
            }
            WorkPayload::Prompt { messages, .. } => {
                let Some(last) = messages.iter().rev().find(|m| m.role == "user") else {
                    return vec![Err(WorkFailure {
                        code: "empty_prompt".to_string(),
                        message: "no user message to respond to".to_string(),
                    })];
                };
                let words: Vec<&str> = last.content.split_whitespace().collect();
                let count = words.len();
                words
                    .into_iter()
                    .enumerate()
                    .map(|(i, w)| {
                        let text = if i + 1 < count {
                            format!("{} ", w)
                        } else {
                            w.to_string()
                        };
                        Ok(ResultPayload::Text { text })
                    })
                    .collect()
            }
            WorkPayload::Text { text, .. } => vec![Ok(ResultPayload::Audio {
                audio: bytes::Bytes::from(text.clone().into_bytes()),
            })],
        }
    }
}

#[async_trait]
impl WorkHandler for EchoHandler {
    async fn handle(&self, item: &WorkItem) -> BoxStream<'static, Result<ResultPayload, WorkFailure>> {
        let delay = self.chunk_delay;
        stream::iter(Self::chunks(item))
            .then(move |chunk| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                chunk
            })
            .boxed()
    }
}
