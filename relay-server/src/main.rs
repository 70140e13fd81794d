use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use relay_core::models::WorkKind;
use relay_core::RelayConfig;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use relay_server::subsystems::dispatcher::WorkHandler;
use relay_server::subsystems::providers::EchoHandler;
use relay_server::Gateway;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "relay.toml")]
    config: String,

    /// Check the store, queue and database, then exit.
    #[arg(long)]
    health: bool,

    /// Also run in-process echo workers for every configured worker pool.
    #[arg(long)]
    echo_workers: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = match RelayConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    let state = match relay_core::create_backend(&config.store).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to connect to session store: {}", e);
            std::process::exit(1);
        }
    };
    let queue = match relay_core::create_queue(&config.queue).await {
        Ok(q) => q,
        Err(e) => {
            eprintln!("Failed to connect to work queue: {}", e);
            std::process::exit(1);
        }
    };
    let pool = match config.database.url.as_deref() {
        Some(url) => match relay_core::db::create_pool(&config.database, url).await {
            Ok(p) => Some(p),
            Err(e) => {
                eprintln!("Failed to connect to credential database: {}", e);
                std::process::exit(1);
            }
        },
        None => None,
    };

    if args.health {
        let mut healthy = true;
        match state.ping().await {
            Ok(()) => println!("✅ Session store ({}) reachable", state.name()),
            Err(e) => {
                println!("❌ Session store ({}) failed: {}", state.name(), e);
                healthy = false;
            }
        }
        match queue.ping().await {
            Ok(()) => println!("✅ Work queue ({}) reachable", queue.name()),
            Err(e) => {
                println!("❌ Work queue ({}) failed: {}", queue.name(), e);
                healthy = false;
            }
        }
        if let Some(pool) = &pool {
            match relay_core::db::health_check(pool).await {
                Ok(v) => println!("✅ PostgreSQL connected: {}", v),
                Err(e) => {
                    println!("❌ PostgreSQL connection failed: {}", e);
                    healthy = false;
                }
            }
        }
        if !healthy {
            std::process::exit(1);
        }
        println!("✅ Relay health check passed");
        return Ok(());
    }

    if let Some(pool) = &pool {
        relay_core::db::ensure_schema(pool).await?;
    }

    let metrics = match relay_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!("Metrics disabled: {}", e);
            None
        }
    };

    let gateway = Gateway::new(config, state, queue, pool);

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let dlq_dispatcher = gateway.dispatcher.clone();
    let dlq_shutdown = tx.subscribe();
    tokio::spawn(async move {
        if let Err(e) = dlq_dispatcher.run_dead_letter_monitor(dlq_shutdown).await {
            tracing::error!("Dead-letter monitor stopped: {}", e);
        }
    });

    let workers = CancellationToken::new();
    if args.echo_workers {
        spawn_echo_workers(&gateway, workers.clone());
    }

    let http_shutdown = tx.subscribe();
    let result = relay_server::http::start_http_server(gateway, metrics, http_shutdown).await;
    workers.cancel();
    result
}

fn spawn_echo_workers(gateway: &Arc<Gateway>, shutdown: CancellationToken) {
    let pools: BTreeSet<String> = WorkKind::ALL
        .iter()
        .flat_map(|kind| gateway.providers.pools_for(*kind))
        .collect();
    let handler: Arc<dyn WorkHandler> = Arc::new(EchoHandler {
        chunk_delay: Duration::from_millis(20),
    });
    for pool in pools {
        let dispatcher = gateway.dispatcher.clone();
        let handler = handler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let group = format!("echo-{}", pool);
            if let Err(e) = dispatcher.run_worker(group, pool.clone(), handler, shutdown).await {
                tracing::error!(pool = %pool, "Echo worker stopped: {}", e);
            }
        });
    }
}
