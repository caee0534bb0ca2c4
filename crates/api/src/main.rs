use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use sitefleet_api::app::{self, services, AppServices};
use sitefleet_infra::jobs::{JobStore, PostgresJobStore, Sweeper, SweeperConfig};
use sitefleet_infra::QueueConfig;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sitefleet_observability::init();

    let config = QueueConfig::from_env().context("invalid job queue configuration")?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PostgresJobStore::new(pool);
    store.ensure_schema().await.context("failed to create jobs schema")?;

    let store: Arc<dyn JobStore> = Arc::new(store);
    let queue = services::build_queue(&config, store)
        .await
        .context("failed to initialize job queue")?;

    let sweeper = Sweeper::new(
        queue.clone(),
        SweeperConfig::default()
            .with_interval(config.sweep_interval)
            .with_lease_timeout(config.lease_timeout),
    )
    .spawn();

    let app = app::build_app(AppServices::new(queue));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        backend = config.backend.as_str(),
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    sweeper.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
