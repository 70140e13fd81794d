use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Connected,
    Disconnected,
    Expired,
}

impl SessionStatus {
    fn rank(self) -> u8 {
        match self {
            SessionStatus::Created => 0,
            SessionStatus::Connected => 1,
            SessionStatus::Disconnected => 2,
            SessionStatus::Expired => 3,
        }
    }

    /// Forward-only, except a reconnect (`disconnected → connected`).
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        if self == next {
            return true;
        }
        if self == SessionStatus::Disconnected && next == SessionStatus::Connected {
            return true;
        }
        next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationItem {
    pub id: String,
    pub role: ItemRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One logical conversation, independent of any physical connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub tenant_id: String,
    /// Advisory: the gateway that last claimed the session.
    pub gateway_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    /// Opaque to the gateway (voice, model, temperature, instructions, ...).
    pub config: serde_json::Value,
    pub items: VecDeque<ConversationItem>,
    #[serde(default)]
    pub overflowed_items: u64,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        gateway_id: impl Into<String>,
        config: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            gateway_id: gateway_id.into(),
            status: SessionStatus::Created,
            created_at: now,
            last_heartbeat_at: now,
            config: normalize_config(config),
            items: VecDeque::new(),
            overflowed_items: 0,
        }
    }

    /// Append an item, dropping the oldest ones beyond `cap`.
    pub fn push_item(&mut self, item: ConversationItem, cap: usize) {
        self.items.push_back(item);
        while self.items.len() > cap.max(1) {
            self.items.pop_front();
            self.overflowed_items += 1;
        }
    }

    /// Shallow-merge `patch` into the config object. `null` values remove keys.
    pub fn merge_config(&mut self, patch: &serde_json::Map<String, serde_json::Value>) {
        if !self.config.is_object() {
            self.config = serde_json::json!({});
        }
        if let Some(obj) = self.config.as_object_mut() {
            for (k, v) in patch {
                if v.is_null() {
                    obj.remove(k);
                } else {
                    obj.insert(k.clone(), v.clone());
                }
            }
        }
    }

    pub fn set_status(&mut self, next: SessionStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    pub fn last_user_text(&self) -> Option<&str> {
        self.items
            .iter()
            .rev()
            .find(|i| i.role == ItemRole::User)
            .map(|i| i.content.as_str())
    }
}

fn normalize_config(config: serde_json::Value) -> serde_json::Value {
    if config.is_object() {
        config
    } else {
        serde_json::json!({})
    }
}

/// Mutation broadcast on a session's change channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionChange {
    Created,
    StatusChanged { status: SessionStatus },
    ConfigUpdated { config: serde_json::Value },
    ItemAppended { item_id: String },
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionDelta {
    pub session_id: String,
    pub version: u64,
    pub gateway_id: String,
    pub change: SessionChange,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(n: usize) -> ConversationItem {
        ConversationItem {
            id: format!("item_{}", n),
            role: ItemRole::User,
            content: format!("turn {}", n),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        use SessionStatus::*;
        assert!(Created.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Connected));
        assert!(Disconnected.can_transition_to(Expired));
        assert!(!Connected.can_transition_to(Created));
        assert!(!Expired.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Created));
    }

    #[test]
    fn test_push_item_caps_history() {
        let mut session = Session::new("s", "t", "g", serde_json::json!({}));
        for n in 0..5 {
            session.push_item(item(n), 3);
        }
        assert_eq!(session.items.len(), 3);
        assert_eq!(session.items.front().map(|i| i.id.as_str()), Some("item_2"));
        assert_eq!(session.overflowed_items, 2);
    }

    #[test]
    fn test_merge_config_removes_nulls() {
        let mut session = Session::new("s", "t", "g", serde_json::json!({"voice": "a", "speed": 1.0}));
        let patch = serde_json::json!({"voice": null, "model": "m1"});
        session.merge_config(patch.as_object().unwrap());
        assert_eq!(session.config, serde_json::json!({"speed": 1.0, "model": "m1"}));
    }

    #[test]
    fn test_non_object_config_is_normalized() {
        let session = Session::new("s", "t", "g", serde_json::json!("voice"));
        assert_eq!(session.config, serde_json::json!({}));
    }
}
