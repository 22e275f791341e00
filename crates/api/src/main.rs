use std::sync::Arc;

use anyhow::Context;

use pagequeue_api::app::{self, ApiServices};
use pagequeue_api::config::ApiConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pagequeue_observability::init();

    let config = ApiConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(ApiServices::connect(&config).await?);
    services.alarm.ensure_started();

    let app = app::build_app(services.clone());
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    services.alarm.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
