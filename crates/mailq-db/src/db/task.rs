use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row};
use std::time::Duration;

use mailq_core::models::{Task, TaskStats};

use super::store::{RetryOutcome, StoreError, StoreResult, TaskStore};
use super::transaction::TransactionGuard;

/// Channel used to wake listening workers after an insert.
pub const NEW_TASK_CHANNEL: &str = "mail_queue_new_task";

macro_rules! task_columns {
    () => {
        "id, to_addr, subject, body, status, fail_count, last_error, claimed_at, lease_token, created_at, updated_at"
    };
}

/// Durable task store backed by the `mail_queue` table.
#[derive(Clone)]
pub struct TaskRepository {
    pool: PgPool,
}

impl TaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for TaskRepository {
    #[tracing::instrument(skip(self, subject, body))]
    async fn insert(&self, recipient: &str, subject: &str, body: &str) -> StoreResult<i64> {
        let mut tx = TransactionGuard::begin(&self.pool, "insert").await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO mail_queue (to_addr, subject, body)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(recipient)
        .bind(subject)
        .bind(body)
        .fetch_one(tx.conn()?)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to insert mail task");
            StoreError::Database(e)
        })?;

        // Delivered to listeners only if the insert commits.
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NEW_TASK_CHANNEL)
            .bind(id.to_string())
            .execute(tx.conn()?)
            .await?;

        tx.commit().await?;

        tracing::info!(task_id = id, "Mail task queued");
        Ok(id)
    }

    #[tracing::instrument(skip(self))]
    async fn claim_batch(&self, limit: i64) -> StoreResult<Vec<Task>> {
        let mut tx = TransactionGuard::begin(&self.pool, "claim_batch").await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM mail_queue
            WHERE status = 'pending'
            ORDER BY id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(tx.conn()?)
        .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let mut tasks: Vec<Task> = sqlx::query_as::<Postgres, Task>(concat!(
            r#"
            UPDATE mail_queue
            SET status = 'processing',
                claimed_at = NOW(),
                lease_token = lease_token + 1,
                updated_at = NOW()
            WHERE id = ANY($1)
            RETURNING "#,
            task_columns!()
        ))
        .bind(&ids)
        .fetch_all(tx.conn()?)
        .await?;

        tx.commit().await?;

        // RETURNING order is unspecified.
        tasks.sort_by_key(|task| task.id);

        tracing::debug!(count = tasks.len(), "Claimed mail tasks");
        Ok(tasks)
    }

    #[tracing::instrument(skip(self))]
    async fn renew_lease(&self, id: i64, lease_token: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE mail_queue
            SET claimed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
                AND status = 'processing'
                AND lease_token = $2
            "#,
        )
        .bind(id)
        .bind(lease_token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn mark_sent(&self, id: i64, lease_token: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE mail_queue
            SET status = 'sent',
                claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1
                AND status IN ('processing', 'pending')
                AND lease_token = $2
            "#,
        )
        .bind(id)
        .bind(lease_token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self, error))]
    async fn record_failure(
        &self,
        id: i64,
        lease_token: i64,
        retry_limit: i32,
        error: &str,
    ) -> StoreResult<RetryOutcome> {
        let fail_count: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE mail_queue
            SET status = 'pending',
                fail_count = fail_count + 1,
                last_error = $4,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1
                AND status = 'processing'
                AND lease_token = $2
                AND fail_count < $3
            RETURNING fail_count
            "#,
        )
        .bind(id)
        .bind(lease_token)
        .bind(retry_limit)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match fail_count {
            Some(fail_count) => RetryOutcome::Requeued { fail_count },
            None => RetryOutcome::Exhausted,
        })
    }

    #[tracing::instrument(skip(self, error))]
    async fn mark_dead(&self, id: i64, lease_token: i64, error: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE mail_queue
            SET status = 'dead',
                last_error = $3,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1
                AND status = 'processing'
                AND lease_token = $2
            "#,
        )
        .bind(id)
        .bind(lease_token)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn requeue_expired(&self, lease: Duration) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE mail_queue
            SET status = 'pending',
                claimed_at = NULL,
                updated_at = NOW()
            WHERE status = 'processing'
                AND claimed_at <= NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, id: i64) -> StoreResult<Option<Task>> {
        let task = sqlx::query_as::<Postgres, Task>(concat!(
            "SELECT ",
            task_columns!(),
            " FROM mail_queue WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(task)
    }

    #[tracing::instrument(skip(self))]
    async fn stats(&self) -> StoreResult<TaskStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as total,
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'processing') as processing,
                COUNT(*) FILTER (WHERE status = 'sent') as sent,
                COUNT(*) FILTER (WHERE status = 'dead') as dead
            FROM mail_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TaskStats {
            total: row.get::<Option<i64>, _>("total").unwrap_or(0),
            pending: row.get::<Option<i64>, _>("pending").unwrap_or(0),
            processing: row.get::<Option<i64>, _>("processing").unwrap_or(0),
            sent: row.get::<Option<i64>, _>("sent").unwrap_or(0),
            dead: row.get::<Option<i64>, _>("dead").unwrap_or(0),
        })
    }

    #[tracing::instrument(skip(self))]
    async fn revive(&self, id: i64) -> StoreResult<Option<Task>> {
        let task = sqlx::query_as::<Postgres, Task>(concat!(
            r#"
            UPDATE mail_queue
            SET status = 'pending',
                fail_count = 0,
                last_error = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'dead'
            RETURNING "#,
            task_columns!()
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        if task.is_some() {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(NEW_TASK_CHANNEL)
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
        }

        Ok(task)
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
