//! Explicit per-request context.
//!
//! Every call chain that acts on behalf of a client receives a
//! `RequestContext` argument. Nothing about the tenant or session is kept in
//! ambient or task-local state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub tenant_id: String,
    pub session_id: String,
    pub correlation_id: String,
}

impl RequestContext {
    pub fn new(tenant_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            session_id: session_id.into(),
            correlation_id: new_correlation_id(),
        }
    }

    /// Same tenant and session, fresh correlation id. Used once per client event.
    pub fn child(&self) -> Self {
        Self {
            tenant_id: self.tenant_id.clone(),
            session_id: self.session_id.clone(),
            correlation_id: new_correlation_id(),
        }
    }
}

pub fn new_correlation_id() -> String {
    format!("corr_{}", Uuid::new_v4().simple())
}

pub fn new_session_id() -> String {
    format!("sess_{}", Uuid::new_v4().simple())
}

pub fn new_event_id() -> String {
    format!("evt_{}", Uuid::new_v4().simple())
}

pub fn new_item_id() -> String {
    format!("item_{}", Uuid::new_v4().simple())
}

pub fn new_response_id() -> String {
    format!("resp_{}", Uuid::new_v4().simple())
}
