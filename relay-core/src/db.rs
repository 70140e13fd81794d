use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::DatabaseConfig;

pub async fn create_pool(config: &DatabaseConfig, url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(url)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

/// Create the credential table if it is missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS api_keys (
            key_hash    TEXT PRIMARY KEY,
            tenant_id   TEXT NOT NULL,
            tier        TEXT NOT NULL DEFAULT 'standard',
            scopes      TEXT[] NOT NULL DEFAULT ARRAY['realtime'],
            suspended   BOOLEAN NOT NULL DEFAULT FALSE,
            expires_at  TIMESTAMPTZ,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRow {
    pub tenant_id: String,
    pub tier: String,
    pub scopes: Vec<String>,
    pub suspended: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Keys are stored as hex-encoded SHA-256 digests, never in the clear.
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

pub async fn find_api_key(pool: &PgPool, key: &str) -> Result<Option<ApiKeyRow>, sqlx::Error> {
    sqlx::query_as::<_, ApiKeyRow>(
        "SELECT tenant_id, tier, scopes, suspended, expires_at FROM api_keys WHERE key_hash = $1",
    )
    .bind(hash_api_key(key))
    .fetch_optional(pool)
    .await
}
