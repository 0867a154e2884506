use anyhow::{Context, Result};
use clap::Parser;
use dashrender::config::AppConfig;
use dashrender::http::app_server::AppServer;
use dashrender::telemetry;
use dashrender::RenderEngine;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "dashrender-server", about = "Dashboard render HTTP server")]
struct Cli {
    /// Path to config file
    config: String,

    /// Override `server.host`
    #[arg(long)]
    host: Option<String>,

    /// Override `server.port`
    #[arg(long)]
    port: Option<u16>,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let started = Instant::now();
    let telemetry_guard = telemetry::init_telemetry().map_err(|e| anyhow::anyhow!(e))?;
    let cli = Cli::parse();

    let mut config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading configuration '{}'", cli.config))?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.validate()?;
    tracing::info!(
        config = %cli.config,
        cache_backend = ?config.cache.backend,
        max_parallel_charts = ?config.render.max_parallel_charts,
        "Configuration loaded"
    );
    if cli.check {
        return Ok(());
    }

    let engine = RenderEngine::from_config(&config).await?;
    tracing::info!(
        cache_backend = engine.cache_backend_name(),
        cache_available = engine.cache_available().await,
        "Render engine initialized"
    );

    let app = AppServer::new(engine);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(
        addr = %addr,
        startup_ms = started.elapsed().as_millis() as u64,
        "Server listening"
    );

    axum::serve(listener, app.router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    drop(telemetry_guard);
    Ok(())
}

/// Resolves on Ctrl+C or, on unix, SIGTERM. A handler that fails to install
/// never resolves, leaving the other one in charge.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining in-flight renders");
}
