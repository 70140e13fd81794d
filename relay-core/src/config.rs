use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub service: ServiceConfig,
    pub http: HttpConfig,
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub rate_limit: RateLimitConfig,
    pub breaker: BreakerConfig,
    pub timeouts: TimeoutConfig,
    pub ordering: OrderingConfig,
    pub protocol: ProtocolConfig,
    pub providers: ProvidersConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    /// Identifier of this gateway instance, recorded on sessions it owns.
    /// Generated at startup when empty.
    pub gateway_id: String,
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            gateway_id: String::new(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Token required by `GET /sessions`. The endpoint is disabled when unset.
    pub admin_token: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8780,
            admin_token: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Redis,
    Nats,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    pub url: String,
    pub key_prefix: String,
    pub heartbeat_interval_seconds: u64,
    pub session_ttl_seconds: u64,
    pub max_items: usize,
    pub update_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "relay".to_string(),
            heartbeat_interval_seconds: 15,
            session_ttl_seconds: 45,
            max_items: 50,
            update_attempts: 3,
        }
    }
}

impl StoreConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: BackendKind,
    pub url: String,
    pub stream_name: String,
    pub partitions: u32,
    pub max_retries: u32,
    pub ack_wait_ms: u64,
    pub backoff_base_ms: u64,
    pub max_buffered_results: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            url: "nats://127.0.0.1:4222".to_string(),
            stream_name: "RELAY_WORK".to_string(),
            partitions: 16,
            max_retries: 3,
            ack_wait_ms: 5_000,
            backoff_base_ms: 500,
            max_buffered_results: 1_024,
        }
    }
}

impl QueueConfig {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }

    /// Redelivery delays for attempts 2..=max_retries+1, doubling each time.
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        (0..self.max_retries)
            .map(|i| Duration::from_millis(self.backoff_base_ms.saturating_mul(1 << i)))
            .collect()
    }
}

/// Behaviour when the rate-limit backend cannot answer in time.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    #[default]
    Open,
    Closed,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LimitScope {
    #[default]
    Tenant,
    ApiKey,
    Ip,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LimitOverride {
    pub requests_per_window: Option<u64>,
    pub units_per_window: Option<u64>,
    pub fail_mode: Option<FailMode>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_seconds: u64,
    pub requests_per_window: u64,
    pub units_per_window: u64,
    pub fail_mode: FailMode,
    pub scope: LimitScope,
    /// Overrides keyed by tenant tier (e.g. `free`, `pro`, `enterprise`).
    pub tiers: HashMap<String, LimitOverride>,
    /// Overrides keyed by tenant id. Take precedence over tiers.
    pub tenants: HashMap<String, LimitOverride>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            requests_per_window: 600,
            units_per_window: 200_000,
            fail_mode: FailMode::Open,
            scope: LimitScope::Tenant,
            tiers: HashMap::new(),
            tenants: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: u64,
    pub call_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_seconds: 30,
            call_timeout_ms: 10_000,
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_seconds)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimeoutConfig {
    pub admission_ms: u64,
    pub restore_ms: u64,
    pub rate_limit_ms: u64,
    pub enqueue_ms: u64,
    pub drain_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            admission_ms: 100,
            restore_ms: 50,
            rate_limit_ms: 5,
            enqueue_ms: 250,
            drain_seconds: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn admission(&self) -> Duration {
        Duration::from_millis(self.admission_ms)
    }

    pub fn restore(&self) -> Duration {
        Duration::from_millis(self.restore_ms)
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }

    pub fn enqueue(&self) -> Duration {
        Duration::from_millis(self.enqueue_ms)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OrderingConfig {
    pub buffer_capacity: usize,
    pub gap_timeout_ms: u64,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 256,
            gap_timeout_ms: 2_000,
        }
    }
}

impl OrderingConfig {
    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProtocolConfig {
    pub max_event_bytes: usize,
    pub max_audio_buffer_bytes: usize,
    /// Create a response automatically once a committed turn is transcribed.
    pub auto_response: bool,
    /// Weighted units charged per KiB of committed audio.
    pub units_per_audio_kib: u64,
    /// Weighted units charged per response.
    pub units_per_response: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_event_bytes: 256 * 1024,
            max_audio_buffer_bytes: 15 * 1024 * 1024,
            auto_response: true,
            units_per_audio_kib: 1,
            units_per_response: 256,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    WorkerPool,
    Loopback,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Provider name, also the circuit-breaker dependency name.
    pub name: String,
    /// Worker pool subject segment. Defaults to the capability's work kind.
    #[serde(default)]
    pub pool: Option<String>,
    /// Loopback only: pause between emitted chunks.
    #[serde(default)]
    pub chunk_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProvidersConfig {
    pub transcribe: Vec<ProviderConfig>,
    pub generate: Vec<ProviderConfig>,
    pub synthesize: Vec<ProviderConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        let pool = |name: &str| {
            vec![ProviderConfig {
                kind: ProviderKind::WorkerPool,
                name: name.to_string(),
                pool: Some(name.to_string()),
                chunk_delay_ms: 0,
            }]
        };
        Self {
            transcribe: pool("stt"),
            generate: pool("llm"),
            synthesize: pool("tts"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub keys: Vec<StaticKeyConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StaticKeyConfig {
    pub key: String,
    pub tenant_id: String,
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_tier() -> String {
    "standard".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["realtime".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

impl RelayConfig {
    /// Load `path` (optional) and apply `RELAY__SECTION__KEY` environment overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("RELAY").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_targets() {
        let config = RelayConfig::default();
        assert_eq!(config.timeouts.admission(), Duration::from_millis(100));
        assert_eq!(config.timeouts.restore(), Duration::from_millis(50));
        assert_eq!(config.timeouts.rate_limit(), Duration::from_millis(5));
        assert_eq!(config.timeouts.drain(), Duration::from_secs(30));
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.recovery_timeout(), Duration::from_secs(30));
        assert_eq!(config.rate_limit.fail_mode, FailMode::Open);
        assert_eq!(config.store.update_attempts, 3);
        assert!(config.store.session_ttl_seconds >= 2 * config.store.heartbeat_interval_seconds);
    }

    #[test]
    fn test_backoff_schedule_doubles() {
        let queue = QueueConfig {
            backoff_base_ms: 100,
            max_retries: 3,
            ..QueueConfig::default()
        };
        assert_eq!(
            queue.backoff_schedule(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[test]
    fn test_from_toml_with_overrides() {
        let config = RelayConfig::from_toml(
            r#"
            [store]
            backend = "redis"
            session_ttl_seconds = 60

            [rate_limit]
            requests_per_window = 100

            [rate_limit.tiers.regulated]
            fail_mode = "closed"

            [rate_limit.tenants.acme]
            requests_per_window = 1000

            [[auth.keys]]
            key = "sk-test"
            tenant_id = "acme"

            [[providers.generate]]
            kind = "worker_pool"
            name = "llm-primary"
            pool = "llm"

            [[providers.generate]]
            kind = "loopback"
            name = "llm-echo"
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.store.backend, BackendKind::Redis);
        assert_eq!(config.store.session_ttl_seconds, 60);
        assert_eq!(config.store.heartbeat_interval_seconds, 15);
        assert_eq!(config.rate_limit.requests_per_window, 100);
        assert_eq!(
            config.rate_limit.tiers["regulated"].fail_mode,
            Some(FailMode::Closed)
        );
        assert_eq!(config.rate_limit.tenants["acme"].requests_per_window, Some(1000));
        assert_eq!(config.auth.keys[0].tier, "standard");
        assert_eq!(config.auth.keys[0].scopes, vec!["realtime".to_string()]);
        assert_eq!(config.providers.generate.len(), 2);
        assert_eq!(config.providers.generate[1].kind, ProviderKind::Loopback);
        // Untouched sections keep their defaults
        assert_eq!(config.providers.transcribe[0].name, "stt");
    }
}
