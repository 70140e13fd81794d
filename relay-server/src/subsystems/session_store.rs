//! Session Store Client.
//!
//! Sessions live in the shared-state backend as versioned JSON records.
//! Updates are optimistic (read, mutate, conditional write on the version),
//! the TTL is refreshed only by `heartbeat`, and every committed change is
//! announced on a per-session channel so other gateways can follow along.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use relay_core::config::StoreConfig;
use relay_core::models::{
    ConversationItem, Session, SessionChange, SessionDelta, SessionStatus, WorkItem, WorkKind,
};
use relay_core::store::{CasOutcome, StateBackend};
use relay_core::{RelayError, RequestContext};

/// Minimum lifetime of a sequence counter, so a reconnect continues it.
const SEQUENCE_TTL: Duration = Duration::from_secs(3600);

/// What a cancellation covers.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelScope {
    /// One response and every item produced for it.
    Response(String),
    /// Every item of the session enqueued up to these sequence numbers.
    Session(HashMap<WorkKind, u64>),
}

pub struct SessionStoreClient {
    backend: Arc<dyn StateBackend>,
    config: StoreConfig,
    gateway_id: String,
}

impl SessionStoreClient {
    pub fn new(backend: Arc<dyn StateBackend>, config: StoreConfig, gateway_id: impl Into<String>) -> Self {
        Self {
            backend,
            config,
            gateway_id: gateway_id.into(),
        }
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    fn session_key(&self, session_id: &str) -> String {
        format!("{}:session:{}", self.config.key_prefix, session_id)
    }

    fn session_prefix(&self) -> String {
        format!("{}:session:", self.config.key_prefix)
    }

    fn change_channel(&self, session_id: &str) -> String {
        format!("{}:changes:{}", self.config.key_prefix, session_id)
    }

    fn sequence_key(&self, session_id: &str, kind: WorkKind) -> String {
        format!("{}:seq:{}:{}", self.config.key_prefix, session_id, kind)
    }

    fn response_cancel_key(&self, session_id: &str, response_id: &str) -> String {
        format!("{}:cancel:{}:{}", self.config.key_prefix, session_id, response_id)
    }

    fn session_cancel_key(&self, session_id: &str) -> String {
        format!("{}:cancel:{}", self.config.key_prefix, session_id)
    }

    // ========================================================================
    // Record lifecycle
    // ========================================================================

    /// Create a new session. Fails with a conflict if a live record exists.
    pub async fn create(
        &self,
        ctx: &RequestContext,
        config: serde_json::Value,
    ) -> Result<Session, RelayError> {
        let session = Session::new(&ctx.session_id, &ctx.tenant_id, &self.gateway_id, config);
        let value = serde_json::to_string(&session)?;
        let created = self
            .backend
            .insert_if_absent(&self.session_key(&session.id), &value, self.config.session_ttl())
            .await?;
        if !created {
            return Err(RelayError::Conflict(format!(
                "session {} already exists",
                session.id
            )));
        }
        tracing::debug!(session_id = %session.id, tenant_id = %session.tenant_id, "Session created");
        self.announce(&session.id, 1, SessionChange::Created).await;
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Session, RelayError> {
        self.get_versioned(session_id).await.map(|(session, _)| session)
    }

    async fn get_versioned(&self, session_id: &str) -> Result<(Session, u64), RelayError> {
        let record = self
            .backend
            .get(&self.session_key(session_id))
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("session {}", session_id)))?;
        let mut session: Session = serde_json::from_str(&record.value)?;
        if let Some(ms) = record.heartbeat_ms {
            if let Some(at) = chrono::DateTime::from_timestamp_millis(ms) {
                session.last_heartbeat_at = at;
            }
        }
        Ok((session, record.version))
    }

    /// Apply `mutator` with optimistic concurrency. A version clash re-reads
    /// and re-applies, up to `update_attempts` times.
    pub async fn update<F>(&self, session_id: &str, mut mutator: F) -> Result<Session, RelayError>
    where
        F: FnMut(&mut Session) -> Result<SessionChange, RelayError>,
    {
        let key = self.session_key(session_id);
        let attempts = self.config.update_attempts.max(1);
        for attempt in 1..=attempts {
            let (mut session, version) = self.get_versioned(session_id).await?;
            let change = mutator(&mut session)?;
            let value = serde_json::to_string(&session)?;
            match self.backend.compare_and_set(&key, version, &value).await? {
                CasOutcome::Applied { version } => {
                    self.announce(session_id, version, change).await;
                    return Ok(session);
                }
                CasOutcome::Missing => {
                    return Err(RelayError::NotFound(format!("session {}", session_id)))
                }
                CasOutcome::VersionMismatch => {
                    tracing::debug!(session_id, attempt, "Session version clash, retrying");
                    metrics::counter!("relay_session_update_conflicts_total").increment(1);
                }
            }
        }
        Err(RelayError::Conflict(format!(
            "session {} modified concurrently {} times",
            session_id, attempts
        )))
    }

    /// Refresh the TTL and heartbeat stamp without reading the record.
    /// Returns false when the session has already expired.
    pub async fn heartbeat(&self, session_id: &str) -> Result<bool, RelayError> {
        let alive = self
            .backend
            .touch(
                &self.session_key(session_id),
                self.config.session_ttl(),
                Utc::now().timestamp_millis(),
            )
            .await?;
        if !alive {
            tracing::warn!(session_id, "Heartbeat for expired session");
        }
        Ok(alive)
    }

    pub async fn publish_change(&self, delta: &SessionDelta) -> Result<(), RelayError> {
        let message = serde_json::to_string(delta)?;
        self.backend
            .publish(&self.change_channel(&delta.session_id), &message)
            .await?;
        Ok(())
    }

    /// Change notifications are best-effort; the record stays authoritative.
    async fn announce(&self, session_id: &str, version: u64, change: SessionChange) {
        let delta = SessionDelta {
            session_id: session_id.to_string(),
            version,
            gateway_id: self.gateway_id.clone(),
            change,
            at: Utc::now(),
        };
        if let Err(e) = self.publish_change(&delta).await {
            tracing::warn!(session_id, "Failed to publish session change: {}", e);
        }
    }

    pub async fn subscribe_changes(
        &self,
        session_id: &str,
    ) -> Result<BoxStream<'static, SessionDelta>, RelayError> {
        let raw = self.backend.subscribe(&self.change_channel(session_id)).await?;
        Ok(raw
            .filter_map(|msg| async move { serde_json::from_str::<SessionDelta>(&msg).ok() })
            .boxed())
    }

    // ========================================================================
    // Helpers on top of update
    // ========================================================================

    async fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<Session, RelayError> {
        let gateway_id = self.gateway_id.clone();
        self.update(session_id, |session| {
            if !session.set_status(status) {
                return Err(RelayError::invalid(
                    "invalid_transition",
                    format!("session cannot move from {} to {}", session.status.as_str(), status.as_str()),
                ));
            }
            if status == SessionStatus::Connected {
                session.gateway_id = gateway_id.clone();
            }
            Ok(SessionChange::StatusChanged { status })
        })
        .await
    }

    pub async fn mark_connected(&self, session_id: &str) -> Result<Session, RelayError> {
        self.set_status(session_id, SessionStatus::Connected).await
    }

    pub async fn mark_disconnected(&self, session_id: &str) -> Result<Session, RelayError> {
        self.set_status(session_id, SessionStatus::Disconnected).await
    }

    pub async fn update_config(
        &self,
        session_id: &str,
        patch: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Session, RelayError> {
        self.update(session_id, |session| {
            session.merge_config(patch);
            Ok(SessionChange::ConfigUpdated {
                config: session.config.clone(),
            })
        })
        .await
    }

    pub async fn append_item(&self, session_id: &str, item: ConversationItem) -> Result<Session, RelayError> {
        let cap = self.config.max_items;
        self.update(session_id, |session| {
            session.push_item(item.clone(), cap);
            Ok(SessionChange::ItemAppended {
                item_id: item.id.clone(),
            })
        })
        .await
    }

    /// Explicit close: the record is removed and peers see `Closed`.
    pub async fn close(&self, session_id: &str) -> Result<bool, RelayError> {
        let removed = self.backend.delete(&self.session_key(session_id)).await?;
        self.announce(session_id, 0, SessionChange::Closed).await;
        Ok(removed)
    }

    pub async fn list(&self, tenant_id: Option<&str>) -> Result<Vec<Session>, RelayError> {
        let prefix = self.session_prefix();
        let mut sessions = Vec::new();
        for key in self.backend.scan_prefix(&prefix).await? {
            let Some(id) = key.strip_prefix(&prefix) else {
                continue;
            };
            // Records may expire between the scan and the read
            let session = match self.get(id).await {
                Ok(s) => s,
                Err(RelayError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if tenant_id.map_or(true, |t| t == session.tenant_id) {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    // ========================================================================
    // Sequencing and cancellation
    // ========================================================================

    /// Next sequence number for (session, kind), shared across gateways.
    pub async fn next_sequence(&self, session_id: &str, kind: WorkKind) -> Result<u64, RelayError> {
        let ttl = SEQUENCE_TTL.max(self.config.session_ttl() * 2);
        Ok(self
            .backend
            .increment(&self.sequence_key(session_id, kind), ttl)
            .await?)
    }

    pub async fn set_cancelled(&self, session_id: &str, scope: &CancelScope) -> Result<(), RelayError> {
        let ttl = self.config.session_ttl();
        match scope {
            CancelScope::Response(response_id) => {
                self.backend
                    .set_flag(&self.response_cancel_key(session_id, response_id), ttl)
                    .await?;
            }
            CancelScope::Session(watermarks) => {
                self.raise_watermarks(session_id, watermarks, ttl).await?;
            }
        }
        Ok(())
    }

    async fn raise_watermarks(
        &self,
        session_id: &str,
        watermarks: &HashMap<WorkKind, u64>,
        ttl: Duration,
    ) -> Result<(), RelayError> {
        let key = self.session_cancel_key(session_id);
        for _ in 0..self.config.update_attempts.max(1) {
            let Some(record) = self.backend.get(&key).await? else {
                let value = serde_json::to_string(watermarks)?;
                if self.backend.insert_if_absent(&key, &value, ttl).await? {
                    return Ok(());
                }
                continue;
            };
            let mut merged: HashMap<WorkKind, u64> = serde_json::from_str(&record.value)?;
            for (kind, seq) in watermarks {
                let slot = merged.entry(*kind).or_insert(0);
                *slot = (*slot).max(*seq);
            }
            let value = serde_json::to_string(&merged)?;
            if let CasOutcome::Applied { .. } =
                self.backend.compare_and_set(&key, record.version, &value).await?
            {
                return Ok(());
            }
        }
        Err(RelayError::Conflict(format!(
            "cancellation for session {} modified concurrently",
            session_id
        )))
    }

    /// Cancellation probe used by workers between output chunks.
    pub async fn is_cancelled(&self, item: &WorkItem) -> Result<bool, RelayError> {
        if let Some(response_id) = &item.response_id {
            if self
                .backend
                .flag_exists(&self.response_cancel_key(&item.session_id, response_id))
                .await?
            {
                return Ok(true);
            }
        }
        let Some(record) = self.backend.get(&self.session_cancel_key(&item.session_id)).await? else {
            return Ok(false);
        };
        let watermarks: HashMap<WorkKind, u64> = serde_json::from_str(&record.value)?;
        Ok(watermarks
            .get(&item.work_kind)
            .is_some_and(|upto| item.sequence <= *upto))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::models::{ItemRole, WorkPayload};
    use relay_core::store::MemoryBackend;

    fn client(backend: Arc<dyn StateBackend>, gateway: &str) -> SessionStoreClient {
        SessionStoreClient::new(
            backend,
            StoreConfig {
                session_ttl_seconds: 30,
                max_items: 2,
                ..StoreConfig::default()
            },
            gateway,
        )
    }

    fn ctx(session: &str) -> RequestContext {
        RequestContext::new("tenant-a", session)
    }

    #[tokio::test]
    async fn test_create_conflicts_on_live_record() {
        let store = client(Arc::new(MemoryBackend::new()), "gw-a");
        let session = store.create(&ctx("sess_1"), serde_json::json!({"voice": "a"})).await.unwrap();
        assert_eq!(session.status, SessionStatus::Created);
        let err = store.create(&ctx("sess_1"), serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, RelayError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = client(Arc::new(MemoryBackend::new()), "gw-a");
        assert!(matches!(store.get("nope").await, Err(RelayError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_retries_then_conflicts() {
        let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
        let store = client(backend.clone(), "gw-a");
        store.create(&ctx("sess_1"), serde_json::json!({})).await.unwrap();

        // A concurrent writer bumps the version on every attempt
        let key = "relay:session:sess_1".to_string();
        let mut calls = 0;
        let err = store
            .update("sess_1", |session| {
                calls += 1;
                let raw = serde_json::to_string(&*session).unwrap();
                let backend = backend.clone();
                let key = key.clone();
                futures::executor::block_on(async move {
                    let current = backend.get(&key).await.unwrap().unwrap();
                    backend.compare_and_set(&key, current.version, &raw).await.unwrap();
                });
                Ok(SessionChange::ConfigUpdated { config: session.config.clone() })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Conflict(_)));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_status_machine_is_enforced() {
        let store = client(Arc::new(MemoryBackend::new()), "gw-a");
        store.create(&ctx("sess_1"), serde_json::json!({})).await.unwrap();
        store.mark_connected("sess_1").await.unwrap();
        store.mark_disconnected("sess_1").await.unwrap();
        let reconnected = store.mark_connected("sess_1").await.unwrap();
        assert_eq!(reconnected.status, SessionStatus::Connected);
    }

    #[tokio::test]
    async fn test_append_item_caps_history() {
        let store = client(Arc::new(MemoryBackend::new()), "gw-a");
        store.create(&ctx("sess_1"), serde_json::json!({})).await.unwrap();
        for n in 0..3 {
            store
                .append_item(
                    "sess_1",
                    ConversationItem {
                        id: format!("item_{}", n),
                        role: ItemRole::User,
                        content: format!("hello {}", n),
                        created_at: Utc::now(),
                    },
                )
                .await
                .unwrap();
        }
        let session = store.get("sess_1").await.unwrap();
        assert_eq!(session.items.len(), 2);
        assert_eq!(session.overflowed_items, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_extends_and_absence_expires() {
        let store = client(Arc::new(MemoryBackend::new()), "gw-a");
        store.create(&ctx("sess_1"), serde_json::json!({})).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(store.heartbeat("sess_1").await.unwrap());
        // Updates do not extend the TTL
        store.update_config("sess_1", serde_json::json!({"voice": "b"}).as_object().unwrap()).await.unwrap();

        tokio::time::advance(Duration::from_millis(29_999)).await;
        assert!(store.get("sess_1").await.is_ok(), "must not expire before TTL");
        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(matches!(store.get("sess_1").await, Err(RelayError::NotFound(_))));
        assert!(!store.heartbeat("sess_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_changes_reach_other_gateway() {
        let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
        let a = client(backend.clone(), "gw-a");
        let b = client(backend, "gw-b");
        a.create(&ctx("sess_1"), serde_json::json!({})).await.unwrap();

        let mut changes = b.subscribe_changes("sess_1").await.unwrap();
        a.update_config("sess_1", serde_json::json!({"voice": "c"}).as_object().unwrap())
            .await
            .unwrap();

        let delta = tokio::time::timeout(Duration::from_millis(100), changes.next())
            .await
            .expect("delta within 100ms")
            .unwrap();
        assert_eq!(delta.gateway_id, "gw-a");
        assert_eq!(delta.version, 2);
        assert!(matches!(delta.change, SessionChange::ConfigUpdated { .. }));
        assert_eq!(b.get("sess_1").await.unwrap().config["voice"], "c");
    }

    #[tokio::test]
    async fn test_list_filters_by_tenant_and_close_removes() {
        let store = client(Arc::new(MemoryBackend::new()), "gw-a");
        store.create(&ctx("sess_1"), serde_json::json!({})).await.unwrap();
        store
            .create(&RequestContext::new("tenant-b", "sess_2"), serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(store.list(None).await.unwrap().len(), 2);
        let only_b = store.list(Some("tenant-b")).await.unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].id, "sess_2");

        assert!(store.close("sess_2").await.unwrap());
        assert_eq!(store.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sequences_and_cancellation_scopes() {
        let store = client(Arc::new(MemoryBackend::new()), "gw-a");
        assert_eq!(store.next_sequence("sess_1", WorkKind::Llm).await.unwrap(), 1);
        assert_eq!(store.next_sequence("sess_1", WorkKind::Llm).await.unwrap(), 2);
        assert_eq!(store.next_sequence("sess_1", WorkKind::Tts).await.unwrap(), 1);

        let item = |kind, sequence, response: Option<&str>| WorkItem {
            session_id: "sess_1".into(),
            tenant_id: "tenant-a".into(),
            work_kind: kind,
            sequence,
            correlation_id: "corr".into(),
            response_id: response.map(str::to_string),
            payload: WorkPayload::Text {
                text: "hi".into(),
                voice: None,
                config: serde_json::json!({}),
            },
            enqueued_at: Utc::now(),
        };

        store
            .set_cancelled("sess_1", &CancelScope::Response("resp_1".into()))
            .await
            .unwrap();
        assert!(store.is_cancelled(&item(WorkKind::Tts, 4, Some("resp_1"))).await.unwrap());
        assert!(!store.is_cancelled(&item(WorkKind::Tts, 4, Some("resp_2"))).await.unwrap());

        let mut upto = HashMap::new();
        upto.insert(WorkKind::Stt, 3);
        store.set_cancelled("sess_1", &CancelScope::Session(upto)).await.unwrap();
        assert!(store.is_cancelled(&item(WorkKind::Stt, 3, None)).await.unwrap());
        assert!(!store.is_cancelled(&item(WorkKind::Stt, 4, None)).await.unwrap());
    }
}
