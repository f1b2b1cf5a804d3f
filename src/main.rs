use std::sync::Arc;

use anyhow::Context;

use inference_dispatch::api::dispatch_routes;
use inference_dispatch::config::DispatchConfig;
use inference_dispatch::dispatcher::Dispatcher;
use inference_dispatch::store::{Database, LibSqlBackend};

/// Process-level settings read from `DISPATCH_*` variables.
struct ServerConfig {
    bind: String,
    port: u16,
    db_path: String,
}

impl ServerConfig {
    fn from_env() -> Self {
        Self {
            bind: std::env::var("DISPATCH_BIND").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("DISPATCH_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            db_path: std::env::var("DISPATCH_DB_PATH")
                .unwrap_or_else(|_| "./data/dispatch.db".to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let server = ServerConfig::from_env();
    let config = DispatchConfig::from_env().context("invalid DISPATCH_* configuration")?;

    eprintln!("Inference dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://{}:{}/api", server.bind, server.port);
    eprintln!("   Events: ws://{}:{}/ws", server.bind, server.port);
    eprintln!(
        "   SLA: {}s, max attempts: {}",
        config.sla.as_secs(),
        config.max_attempts
    );
    if config.operator_key.is_none() {
        tracing::warn!("DISPATCH_OPERATOR_KEY not set, operator routes are disabled");
    }

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = std::path::Path::new(&server.db_path);
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(db_path)
            .await
            .with_context(|| format!("failed to open database at {}", server.db_path))?,
    );
    eprintln!("   Database: {}", server.db_path);

    // ── Dispatcher + startup recovery ───────────────────────────────────
    let dispatcher = Arc::new(Dispatcher::with_store(config, db));
    let stats = dispatcher
        .recover()
        .await
        .context("failed to recover dispatcher state")?;
    if stats.messages > 0 || stats.workers > 0 {
        eprintln!(
            "   Recovered {} workers, {} messages ({} requeued)",
            stats.workers, stats.messages, stats.requeued
        );
    }

    // Timeout sweep and compliance cadence; checks are resolved by an
    // operator through the API
    let _background = dispatcher.spawn_background(None);

    // ── HTTP server ─────────────────────────────────────────────────────
    let app = dispatch_routes(Arc::clone(&dispatcher));
    let addr = format!("{}:{}", server.bind, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "Dispatch server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
