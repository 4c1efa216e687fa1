use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use sms_broker::api;
use sms_broker::broker::Broker;
use sms_broker::config::Config;
use sms_broker::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env().context("Invalid configuration")?;
    config.log_summary();

    eprintln!("📨 SMS Broker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://{}/api/v0", config.server.bind_addr());
    eprintln!("   Moderation: {}", config.filter.api_url);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(Path::new(&config.database.path))
            .await
            .with_context(|| format!("Failed to open database at {}", config.database.path))?,
    );

    // ── Broker ───────────────────────────────────────────────────────────
    let broker = Arc::new(Broker::from_config(db, &config.filter));

    // ── HTTP server ──────────────────────────────────────────────────────
    let app = api::routes(Arc::clone(&broker));
    let listener = tokio::net::TcpListener::bind(config.server.bind_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr()))?;
    tracing::info!(addr = %config.server.bind_addr(), "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("HTTP server failed")?;

    // Finish in-flight moderation so no result is lost.
    broker.shutdown().await;
    Ok(())
}
