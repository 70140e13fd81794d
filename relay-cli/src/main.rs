//! relay-cli: admin frontend for relay gateways.
//!
//! # Subcommands
//! - `status [--json]`                       show gateway health
//! - `sessions [--tenant <id>] [--json]`     list live sessions (needs the admin token)
//! - `metrics [--filter <prefix>]`           dump Prometheus metrics

use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8780";
const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "relay-cli", version, about = "Admin CLI for relay gateways")]
struct Cli {
    /// Gateway HTTP URL (overrides RELAY_HTTP_URL env var)
    #[arg(long, env = "RELAY_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Admin token for the session listing
    #[arg(long, env = "RELAY_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show gateway health, dependencies and breaker states
    Status {
        /// Print the raw JSON body
        #[arg(long)]
        json: bool,
    },

    /// List live sessions
    Sessions {
        /// Only sessions of this tenant
        #[arg(long)]
        tenant: Option<String>,

        /// Print the raw JSON body
        #[arg(long)]
        json: bool,
    },

    /// Print Prometheus metrics
    Metrics {
        /// Only series whose name starts with this prefix
        #[arg(long)]
        filter: Option<String>,
    },
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct Dependency {
    pub backend: String,
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Breaker {
    pub dependency: String,
    pub state: String,
    pub consecutive_failures: u32,
}

/// Body of GET /health
#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub gateway_id: String,
    pub draining: bool,
    pub connections: usize,
    pub session_store: Dependency,
    pub queue: Dependency,
    #[serde(default)]
    pub breakers: Vec<Breaker>,
}

#[derive(Debug, Deserialize)]
pub struct SessionRow {
    pub id: String,
    pub tenant_id: String,
    pub gateway_id: String,
    pub status: String,
    pub created_at: String,
    pub last_heartbeat_at: String,
    pub items: usize,
}

/// Body of GET /sessions
#[derive(Debug, Deserialize)]
pub struct SessionsResponse {
    pub count: usize,
    pub sessions: Vec<SessionRow>,
}

// ============================================================================
// Rendering
// ============================================================================

pub fn render_status(health: &HealthResponse) -> String {
    let dependency = |d: &Dependency| match (&d.error, d.ok) {
        (_, true) => format!("{} ok", d.backend),
        (Some(e), false) => format!("{} DOWN ({})", d.backend, e),
        (None, false) => format!("{} DOWN", d.backend),
    };

    let mut out = String::new();
    out.push_str(&format!("Gateway:       {}\n", health.gateway_id));
    out.push_str(&format!("Status:        {}\n", health.status));
    out.push_str(&format!("Version:       {}\n", health.version));
    out.push_str(&format!(
        "Connections:   {}{}\n",
        health.connections,
        if health.draining { " (draining)" } else { "" }
    ));
    out.push_str(&format!("Session store: {}\n", dependency(&health.session_store)));
    out.push_str(&format!("Work queue:    {}\n", dependency(&health.queue)));
    if !health.breakers.is_empty() {
        out.push_str("Breakers:\n");
        for b in &health.breakers {
            out.push_str(&format!(
                "  {:<24} {:<10} failures={}\n",
                b.dependency, b.state, b.consecutive_failures
            ));
        }
    }
    out
}

pub fn render_sessions(resp: &SessionsResponse) -> String {
    if resp.sessions.is_empty() {
        return "No live sessions\n".to_string();
    }
    let mut out = format!(
        "{:<28} {:<12} {:<12} {:<13} {:>5}  {}\n",
        "SESSION", "TENANT", "GATEWAY", "STATUS", "ITEMS", "LAST HEARTBEAT"
    );
    for s in &resp.sessions {
        out.push_str(&format!(
            "{:<28} {:<12} {:<12} {:<13} {:>5}  {}\n",
            s.id, s.tenant_id, s.gateway_id, s.status, s.items, s.last_heartbeat_at
        ));
    }
    out.push_str(&format!("{} session(s)\n", resp.count));
    out
}

/// Keep metric lines (and their HELP/TYPE headers) whose name starts with `prefix`.
pub fn filter_metrics(body: &str, prefix: &str) -> String {
    body.lines()
        .filter(|line| {
            let name = line
                .strip_prefix("# HELP ")
                .or_else(|| line.strip_prefix("# TYPE "))
                .unwrap_or(line);
            name.starts_with(prefix)
        })
        .map(|line| format!("{}\n", line))
        .collect()
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client(timeout: Duration) -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder().timeout(timeout).build()?)
}

/// GET /health. A 503 still carries a health body, so it is parsed too.
pub fn fetch_health(server: &str) -> anyhow::Result<(bool, serde_json::Value)> {
    let url = format!("{}/health", server);
    let resp = client(Duration::from_secs(10))?
        .get(&url)
        .send()
        .map_err(|e| anyhow::anyhow!("cannot reach {}: {}", url, e))?;
    let healthy = resp.status().is_success();
    let body: serde_json::Value = resp
        .json()
        .map_err(|e| anyhow::anyhow!("failed to parse health response: {}", e))?;
    Ok((healthy, body))
}

pub fn fetch_sessions(
    server: &str,
    admin_token: Option<&str>,
    tenant: Option<&str>,
) -> anyhow::Result<serde_json::Value> {
    let Some(token) = admin_token else {
        anyhow::bail!("an admin token is required (--admin-token or RELAY_ADMIN_TOKEN)");
    };
    let url = format!("{}/sessions", server);
    let mut request = client(Duration::from_secs(10))?
        .get(&url)
        .header(ADMIN_TOKEN_HEADER, token);
    if let Some(tenant) = tenant {
        request = request.query(&[("tenant", tenant)]);
    }
    let resp = request
        .send()
        .map_err(|e| anyhow::anyhow!("cannot reach {}: {}", url, e))?;

    match resp.status().as_u16() {
        200 => Ok(resp.json()?),
        401 => anyhow::bail!("admin token rejected"),
        404 => anyhow::bail!("session listing is disabled on this gateway"),
        code => {
            let body = resp.text().unwrap_or_default();
            anyhow::bail!("server returned {}: {}", code, body)
        }
    }
}

pub fn fetch_metrics(server: &str) -> anyhow::Result<String> {
    let url = format!("{}/metrics", server);
    let resp = client(Duration::from_secs(10))?
        .get(&url)
        .send()
        .map_err(|e| anyhow::anyhow!("cannot reach {}: {}", url, e))?;
    if !resp.status().is_success() {
        anyhow::bail!("server returned {}", resp.status());
    }
    Ok(resp.text()?)
}

fn do_status(server: &str, json: bool) -> anyhow::Result<bool> {
    let (healthy, body) = fetch_health(server)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        let health: HealthResponse = serde_json::from_value(body)?;
        print!("{}", render_status(&health));
    }
    Ok(healthy)
}

fn do_sessions(
    server: &str,
    admin_token: Option<&str>,
    tenant: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let body = fetch_sessions(server, admin_token, tenant)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        let sessions: SessionsResponse = serde_json::from_value(body)?;
        print!("{}", render_sessions(&sessions));
    }
    Ok(())
}

fn do_metrics(server: &str, filter: Option<&str>) -> anyhow::Result<()> {
    let body = fetch_metrics(server)?;
    match filter {
        Some(prefix) => print!("{}", filter_metrics(&body, prefix)),
        None => print!("{}", body),
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();
    let admin_token = cli.admin_token.as_deref();

    let result = match cli.command {
        Commands::Status { json } => do_status(&server, json).map(|healthy| {
            if !healthy {
                std::process::exit(2);
            }
        }),
        Commands::Sessions { tenant, json } => {
            do_sessions(&server, admin_token, tenant.as_deref(), json)
        }
        Commands::Metrics { filter } => do_metrics(&server, filter.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("relay-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn health_body(status: &str, store_ok: bool) -> serde_json::Value {
        serde_json::json!({
            "status": status,
            "version": "0.1.0",
            "gateway_id": "gw-a",
            "draining": false,
            "connections": 3,
            "session_store": if store_ok {
                serde_json::json!({ "backend": "redis", "ok": true })
            } else {
                serde_json::json!({ "backend": "redis", "ok": false, "error": "connection refused" })
            },
            "queue": { "backend": "nats", "ok": true },
            "breakers": [
                { "dependency": "session_store", "state": "closed", "consecutive_failures": 0,
                  "failure_threshold": 5, "recovery_timeout_ms": 30000, "last_failure_ms_ago": null }
            ]
        })
    }

    // The blocking client must not run on the async test thread.
    async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        tokio::task::spawn_blocking(f).await.unwrap()
    }

    // ========================================================================
    // TEST 1: status renders dependencies and breakers
    // ========================================================================
    #[test]
    fn test_render_status() {
        let health: HealthResponse = serde_json::from_value(health_body("healthy", true)).unwrap();
        let out = render_status(&health);
        assert!(out.contains("Gateway:       gw-a"));
        assert!(out.contains("Session store: redis ok"));
        assert!(out.contains("Work queue:    nats ok"));
        assert!(out.contains("session_store"));
        assert!(out.contains("failures=0"));
    }

    // ========================================================================
    // TEST 2: a failed dependency shows its error
    // ========================================================================
    #[test]
    fn test_render_status_down_dependency() {
        let health: HealthResponse = serde_json::from_value(health_body("unhealthy", false)).unwrap();
        let out = render_status(&health);
        assert!(out.contains("Status:        unhealthy"));
        assert!(out.contains("redis DOWN (connection refused)"));
    }

    // ========================================================================
    // TEST 3: empty and populated session tables
    // ========================================================================
    #[test]
    fn test_render_sessions() {
        let empty = SessionsResponse { count: 0, sessions: Vec::new() };
        assert_eq!(render_sessions(&empty), "No live sessions\n");

        let resp: SessionsResponse = serde_json::from_value(serde_json::json!({
            "count": 1,
            "sessions": [{
                "id": "sess_abc", "tenant_id": "acme", "gateway_id": "gw-a",
                "status": "connected", "created_at": "2026-01-01T00:00:00Z",
                "last_heartbeat_at": "2026-01-01T00:00:10Z", "items": 4
            }]
        }))
        .unwrap();
        let out = render_sessions(&resp);
        assert!(out.starts_with("SESSION"));
        assert!(out.contains("sess_abc"));
        assert!(out.contains("connected"));
        assert!(out.ends_with("1 session(s)\n"));
    }

    // ========================================================================
    // TEST 4: metric filtering keeps matching headers and samples
    // ========================================================================
    #[test]
    fn test_filter_metrics() {
        let body = "\
# HELP relay_connections_active Open client connections
# TYPE relay_connections_active gauge
relay_connections_active 2
# HELP relay_dispatch_total Work items dispatched
# TYPE relay_dispatch_total counter
relay_dispatch_total{kind=\"llm\",outcome=\"enqueued\"} 7
";
        let out = filter_metrics(body, "relay_dispatch");
        assert_eq!(out.lines().count(), 3);
        assert!(out.contains("relay_dispatch_total{kind=\"llm\",outcome=\"enqueued\"} 7"));
        assert!(!out.contains("relay_connections_active"));
    }

    // ========================================================================
    // TEST 5: unhealthy gateway still yields a parsed body
    // ========================================================================
    #[tokio::test]
    async fn test_fetch_health_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503).set_body_json(health_body("unhealthy", false)))
            .mount(&server)
            .await;

        let uri = server.uri();
        let (healthy, body) = blocking(move || fetch_health(&uri)).await.unwrap();
        assert!(!healthy);
        assert_eq!(body["status"], "unhealthy");
    }

    // ========================================================================
    // TEST 6: session listing sends the token and tenant filter
    // ========================================================================
    #[tokio::test]
    async fn test_fetch_sessions_sends_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sessions"))
            .and(header(ADMIN_TOKEN_HEADER, "s3cret"))
            .and(query_param("tenant", "acme"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "count": 0, "sessions": [] })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let uri = server.uri();
        let body = blocking(move || fetch_sessions(&uri, Some("s3cret"), Some("acme")))
            .await
            .unwrap();
        assert_eq!(body["count"], 0);
    }

    // ========================================================================
    // TEST 7: rejected token and missing token are errors
    // ========================================================================
    #[tokio::test]
    async fn test_fetch_sessions_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sessions"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let uri = server.uri();
        let rejected = blocking(move || fetch_sessions(&uri, Some("wrong"), None)).await;
        assert!(rejected.unwrap_err().to_string().contains("rejected"));

        let uri = server.uri();
        let missing = blocking(move || fetch_sessions(&uri, None, None)).await;
        assert!(missing.unwrap_err().to_string().contains("admin token"));
    }

    // ========================================================================
    // TEST 8: metrics unavailable surfaces the status code
    // ========================================================================
    #[tokio::test]
    async fn test_fetch_metrics_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metrics"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let uri = server.uri();
        let err = blocking(move || fetch_metrics(&uri)).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }
}
