//! API key authentication.
//!
//! Keys come from two places: static keys in the config file, and the
//! optional Postgres `api_keys` table. Static keys are checked first; the
//! database lookup runs behind the `credential_store` breaker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_core::config::AuthConfig;
use relay_core::db::{find_api_key, hash_api_key};
use relay_core::RelayError;
use sqlx::PgPool;

use super::circuit_breaker::BreakerRegistry;

pub const CREDENTIAL_DEPENDENCY: &str = "credential_store";

/// What a client presented when connecting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credentials {
    pub api_key: Option<String>,
    /// Restore this session instead of creating one.
    pub session_id: Option<String>,
    pub client_ip: Option<String>,
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub tenant_id: String,
    pub tier: String,
    pub scopes: Vec<String>,
    /// Short, non-reversible key identifier for logs and per-key limits.
    pub key_id: String,
}

impl Principal {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == "*")
    }
}

struct KeyRecord {
    tenant_id: String,
    tier: String,
    scopes: Vec<String>,
    suspended: bool,
    expires_at: Option<DateTime<Utc>>,
}

pub struct Authenticator {
    static_keys: HashMap<String, KeyRecord>,
    pool: Option<PgPool>,
    breakers: Arc<BreakerRegistry>,
    lookup_timeout: Duration,
}

impl Authenticator {
    /// `lookup_timeout` bounds the database lookup; expiry counts against
    /// the credential store's breaker.
    pub fn new(
        config: &AuthConfig,
        pool: Option<PgPool>,
        breakers: Arc<BreakerRegistry>,
        lookup_timeout: Duration,
    ) -> Self {
        let static_keys = config
            .keys
            .iter()
            .map(|k| {
                (
                    hash_api_key(&k.key),
                    KeyRecord {
                        tenant_id: k.tenant_id.clone(),
                        tier: k.tier.clone(),
                        scopes: k.scopes.clone(),
                        suspended: k.suspended,
                        expires_at: k.expires_at,
                    },
                )
            })
            .collect();
        Self {
            static_keys,
            pool,
            breakers,
            lookup_timeout,
        }
    }

    pub fn has_database(&self) -> bool {
        self.pool.is_some()
    }

    pub async fn authenticate(&self, api_key: &str) -> Result<Principal, RelayError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(RelayError::Authentication("missing API key".to_string()));
        }
        let key_hash = hash_api_key(api_key);
        let key_id = key_hash[..12].to_string();

        if let Some(record) = self.static_keys.get(&key_hash) {
            return Self::check(record, &key_id);
        }

        let Some(pool) = &self.pool else {
            tracing::warn!(key_id = %key_id, "Unknown API key");
            return Err(RelayError::Authentication("invalid API key".to_string()));
        };
        let row = self
            .breakers
            .call_within(CREDENTIAL_DEPENDENCY, self.lookup_timeout, || async {
                find_api_key(pool, api_key).await.map_err(RelayError::from)
            })
            .await?;
        match row {
            Some(row) => Self::check(
                &KeyRecord {
                    tenant_id: row.tenant_id,
                    tier: row.tier,
                    scopes: row.scopes,
                    suspended: row.suspended,
                    expires_at: row.expires_at,
                },
                &key_id,
            ),
            None => {
                tracing::warn!(key_id = %key_id, "Unknown API key");
                Err(RelayError::Authentication("invalid API key".to_string()))
            }
        }
    }

    fn check(record: &KeyRecord, key_id: &str) -> Result<Principal, RelayError> {
        if record.expires_at.is_some_and(|at| at <= Utc::now()) {
            tracing::warn!(key_id = %key_id, tenant_id = %record.tenant_id, "Expired API key");
            return Err(RelayError::Authentication("API key expired".to_string()));
        }
        if record.suspended {
            tracing::warn!(key_id = %key_id, tenant_id = %record.tenant_id, "Suspended tenant");
            return Err(RelayError::TenantSuspended(record.tenant_id.clone()));
        }
        Ok(Principal {
            tenant_id: record.tenant_id.clone(),
            tier: record.tier.clone(),
            scopes: record.scopes.clone(),
            key_id: key_id.to_string(),
        })
    }
}
