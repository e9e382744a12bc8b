//! Application setup and initialization

pub mod database;
pub mod routes;
pub mod server;

use crate::state::AppState;
use anyhow::{Context, Result};
use mailq_core::{Config, MailSender, QueueBackend};
use mailq_db::{InMemoryTaskStore, TaskRepository, TaskStore};
use mailq_services::SmtpMailer;
use mailq_worker::{TaskQueue, TaskQueueConfig};
use std::sync::Arc;

/// Initialize the entire application: telemetry, task store, worker pool and routes.
pub async fn initialize_app(config: Config) -> Result<(Arc<AppState>, axum::Router)> {
    config
        .validate()
        .context("Configuration validation failed")?;

    mailq_infra::init_telemetry(config.base.log_format, &config.base.environment)
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    tracing::info!(
        backend = ?config.queue.backend,
        environment = %config.base.environment,
        "Configuration loaded and validated successfully"
    );

    let (store, pool) = match config.queue.backend {
        QueueBackend::Postgres => {
            let pool = database::setup_database(&config).await?;
            let store: Arc<dyn TaskStore> = Arc::new(TaskRepository::new(pool.clone()));
            (store, Some(pool))
        }
        QueueBackend::Memory => {
            tracing::warn!(
                capacity = config.queue.memory_capacity,
                retain_finished = config.queue.memory_retain_finished,
                "Using in-memory task store, queued mail is lost on restart"
            );
            let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::with_retention(
                config.queue.memory_capacity,
                config.queue.memory_retain_finished,
            ));
            (store, None)
        }
    };

    let mailer: Arc<dyn MailSender> = Arc::new(
        SmtpMailer::from_config(&config.smtp).context("Failed to configure SMTP mailer")?,
    );

    let queue = Arc::new(TaskQueue::new(
        store,
        mailer,
        TaskQueueConfig::from(&config),
        pool,
    ));

    let state = Arc::new(AppState::new(queue, config.clone()));
    let router = routes::setup_routes(&config, state.clone());

    Ok((state, router))
}
