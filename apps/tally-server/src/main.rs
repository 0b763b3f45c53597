use anyhow::{Context, Result};
use clap::Parser;
use tally_server::{
    build_router,
    config::{Cli, ServerConfig},
    responses::build_response_store,
    telemetry, AppState, SessionRegistry,
};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    telemetry::init_tracing(&config.log_filter)?;
    info!(
        listen_addr = %config.listen_addr,
        redis = config.redis_url.is_some(),
        session_ttl_secs = config.registry.session_ttl.as_secs(),
        idle_threshold_secs = config.registry.idle_threshold.as_secs(),
        "starting tally-server"
    );

    run(config).await
}

async fn run(config: ServerConfig) -> Result<()> {
    let registry = SessionRegistry::new(config.registry.clone());
    let responses = build_response_store(config.redis_url.as_deref()).await;
    info!(backend = responses.backend(), "response store ready");

    let sweeper = config
        .sweep_interval
        .map(|interval| registry.spawn_sweeper(interval));

    let router = build_router(AppState::new(registry, responses));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("tally-server listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
