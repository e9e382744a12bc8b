use async_trait::async_trait;
use std::time::Duration;

use mailq_core::models::{Task, TaskStats};
use mailq_core::AppError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue is full ({capacity} tasks waiting)")]
    QueueFull { capacity: usize },

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Transaction already committed or rolled back")]
    TransactionFinished,
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(e) => AppError::Database(e),
            StoreError::QueueFull { capacity } => AppError::QueueFull { capacity },
            other => anyhow::Error::new(other).into(),
        }
    }
}

/// Result of recording a delivery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The task is back in `pending` with the new failure count.
    Requeued { fail_count: i32 },
    /// The retry ceiling was already reached, or the task is no longer
    /// `processing` under the caller's lease. Nothing was changed.
    Exhausted,
}

/// Persistent home of mail tasks. Every state transition happens through
/// these operations; callers never hold task state between calls.
///
/// A claim hands out the task's new `lease_token`. Only the worker holding
/// the current token may renew the lease or report an outcome, so a task
/// requeued by the lease sweeper and claimed again cannot be settled by its
/// previous holder.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new `pending` task and return its id.
    async fn insert(&self, recipient: &str, subject: &str, body: &str) -> StoreResult<i64>;

    /// Atomically move up to `limit` pending tasks, oldest first, to
    /// `processing`, stamping `claimed_at` and a fresh `lease_token`.
    /// Concurrent callers never receive the same task.
    async fn claim_batch(&self, limit: i64) -> StoreResult<Vec<Task>>;

    /// Restart the lease clock of a task about to be delivered. Returns false
    /// if the task is no longer `processing` under `lease_token`; the caller
    /// must then skip it.
    async fn renew_lease(&self, id: i64, lease_token: i64) -> StoreResult<bool>;

    /// Mark a task delivered. Applies while the task is `processing`, or
    /// `pending` after a lease requeue nobody has claimed yet, under
    /// `lease_token`. Returns false otherwise; a `sent` row is never touched.
    async fn mark_sent(&self, id: i64, lease_token: i64) -> StoreResult<bool>;

    /// Send a `processing` task back to `pending` and bump its failure count,
    /// unless it already has `retry_limit` failures or `lease_token` is stale.
    async fn record_failure(
        &self,
        id: i64,
        lease_token: i64,
        retry_limit: i32,
        error: &str,
    ) -> StoreResult<RetryOutcome>;

    /// Move a `processing` task held under `lease_token` to `dead`. Returns
    /// false otherwise.
    async fn mark_dead(&self, id: i64, lease_token: i64, error: &str) -> StoreResult<bool>;

    /// Return tasks claimed more than `lease` ago to `pending`. The token is
    /// left as is, so the previous holder can still settle the task until
    /// someone claims it again.
    async fn requeue_expired(&self, lease: Duration) -> StoreResult<u64>;

    async fn get(&self, id: i64) -> StoreResult<Option<Task>>;

    async fn stats(&self) -> StoreResult<TaskStats>;

    /// Reset a `dead` task to `pending` with a clean failure count. `None`
    /// when the task does not exist or is not dead.
    async fn revive(&self, id: i64) -> StoreResult<Option<Task>>;

    /// Cheap round trip used by the readiness endpoint.
    async fn ping(&self) -> StoreResult<()>;
}
