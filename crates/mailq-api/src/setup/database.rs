//! Database setup and initialization

use anyhow::{Context, Result};
use mailq_core::Config;
use mailq_db::MIGRATOR;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Connect the pool and apply pending migrations.
pub async fn setup_database(config: &Config) -> Result<PgPool> {
    let url = config
        .queue
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when QUEUE_BACKEND=postgres")?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.queue.db_max_connections)
        .acquire_timeout(Duration::from_secs(config.queue.db_timeout_seconds))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!(
        max_connections = config.queue.db_max_connections,
        "Database connected successfully"
    );

    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    Ok(pool)
}
