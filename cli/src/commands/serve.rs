use anyhow::{Context, Result};
use clap::Args;
use corebit_core::api::{build_router, AppState};
use corebit_core::repository::MemoryRepository;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Arguments for the serve command
#[derive(Args)]
pub struct ServeArgs {
    /// Listen address, e.g. 0.0.0.0:3330 (overrides configuration)
    #[arg(short, long)]
    listen: Option<String>,
}

pub async fn execute(args: ServeArgs, config_path: Option<PathBuf>) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    let repo = Arc::new(MemoryRepository::new());
    let state = AppState::new(config.clone(), repo)
        .await
        .context("failed to initialize the monitoring engine")?;
    state.start_background();

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    info!(
        listen = %config.server.listen_addr,
        version = corebit_core::VERSION,
        "corebit server listening"
    );

    let router = build_router(state.clone());
    axum_serve(listener, router).await?;

    info!("shutting down");
    state.shutdown().await;
    Ok(())
}

async fn axum_serve(listener: tokio::net::TcpListener, router: axum::Router) -> Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt received");
}
