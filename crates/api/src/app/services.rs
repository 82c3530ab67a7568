//! Store and gateway wiring for the HTTP surface.
//!
//! `USE_PERSISTENT_STORES=true` selects the Postgres stores (requires
//! `DATABASE_URL`); otherwise everything lives in memory.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use marketsync_pipeline::{
    DeadLetterStore, InMemoryDeadLetterStore, InMemoryOperationLog, MarketplaceGateway,
    OperationLog, PipelineConfig, PipelineCoordinator, PostgresDeadLetterStore,
    PostgresOperationLog, SweeperConfig,
};

pub struct AppServices {
    pub coordinator: Arc<PipelineCoordinator>,
    /// Used by the background sweeper and by `POST /sync/sweep`.
    pub sweeper: SweeperConfig,
}

impl AppServices {
    pub fn new(
        config: &PipelineConfig,
        log: Arc<dyn OperationLog>,
        dead_letters: Arc<dyn DeadLetterStore>,
        gateway: Arc<dyn MarketplaceGateway>,
    ) -> Self {
        let coordinator = PipelineCoordinator::new(log, dead_letters, gateway)
            .with_retry_ceiling(config.retry_ceiling)
            .with_scheduler(config.scheduler())
            .with_early_retry(config.early_retry);

        Self {
            coordinator: Arc::new(coordinator),
            sweeper: config.sweeper(),
        }
    }

    /// In-memory stores with the given gateway (dev/test).
    pub fn in_memory(config: &PipelineConfig, gateway: Arc<dyn MarketplaceGateway>) -> Self {
        Self::new(
            config,
            InMemoryOperationLog::arc(),
            InMemoryDeadLetterStore::arc(),
            gateway,
        )
    }
}

pub async fn build_services(config: PipelineConfig) -> anyhow::Result<AppServices> {
    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    let gateway: Arc<dyn MarketplaceGateway> = Arc::new(config.gateway.sandbox());

    if use_persistent {
        return build_persistent_services(config, gateway).await;
    }

    tracing::info!("using in-memory operation log and dead-letter store");
    Ok(AppServices::in_memory(&config, gateway))
}

async fn build_persistent_services(
    config: PipelineConfig,
    gateway: Arc<dyn MarketplaceGateway>,
) -> anyhow::Result<AppServices> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let log = PostgresOperationLog::new(pool.clone());
    log.migrate().await.context("failed to migrate sync_operations")?;
    let dead_letters = PostgresDeadLetterStore::new(pool);
    dead_letters
        .migrate()
        .await
        .context("failed to migrate sync_dead_letters")?;

    tracing::info!("using Postgres operation log and dead-letter store");
    Ok(AppServices::new(
        &config,
        Arc::new(log),
        Arc::new(dead_letters),
        gateway,
    ))
}
