use anyhow::Context;

use marketsync_pipeline::{PipelineConfig, RetrySweeper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    marketsync_observability::init();

    let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;
    let bind = std::env::var("MARKETSYNC_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let services = marketsync_api::app::services::build_services(config).await?;
    let sweeper = RetrySweeper::spawn(services.coordinator.clone(), services.sweeper.clone());
    let app = marketsync_api::app::build_app(services);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    sweeper.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
