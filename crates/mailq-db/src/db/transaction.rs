//! Database transaction utilities

use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use super::store::{StoreError, StoreResult};

/// Owns a Postgres transaction for a multi-statement store operation.
///
/// A guard dropped without [`commit`](Self::commit) is rolled back when its
/// connection returns to the pool, so an early `?` return undoes every
/// statement run so far.
///
/// ```ignore
/// let mut tx = TransactionGuard::begin(&pool, "claim_batch").await?;
/// sqlx::query("UPDATE mail_queue ...").execute(tx.conn()?).await?;
/// tx.commit().await?;
/// ```
pub struct TransactionGuard {
    transaction: Option<Transaction<'static, Postgres>>,
    label: &'static str,
}

impl TransactionGuard {
    /// Begin a new transaction. `label` names the operation in logs.
    pub async fn begin(pool: &PgPool, label: &'static str) -> StoreResult<Self> {
        let transaction = pool.begin().await.map_err(|e| {
            tracing::error!(error = %e, operation = label, "Failed to begin transaction");
            StoreError::Database(e)
        })?;

        Ok(Self {
            transaction: Some(transaction),
            label,
        })
    }

    /// Connection to run statements on.
    pub fn conn(&mut self) -> StoreResult<&mut PgConnection> {
        self.transaction
            .as_deref_mut()
            .ok_or(StoreError::TransactionFinished)
    }

    pub async fn commit(mut self) -> StoreResult<()> {
        if let Some(tx) = self.transaction.take() {
            tx.commit().await.map_err(|e| {
                tracing::error!(error = %e, operation = self.label, "Failed to commit transaction");
                StoreError::Database(e)
            })?;
        }
        Ok(())
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        if self.transaction.is_some() {
            tracing::warn!(
                operation = self.label,
                "Transaction dropped without commit, rolling back"
            );
        }
    }
}
