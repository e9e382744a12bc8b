use std::sync::Arc;

use mailq_db::{RetryOutcome, StoreResult, TaskStore};

/// What happened to a task after a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back in `pending` for another attempt.
    Requeued { fail_count: i32 },
    /// Retries exhausted, parked in `dead`.
    DeadLettered,
    /// Retries exhausted but the task was left as is: dead-lettering is
    /// disabled, or another actor already moved the task.
    Unchanged,
}

/// Turns delivery failures into store transitions.
#[derive(Clone)]
pub struct RetryAccountant {
    store: Arc<dyn TaskStore>,
    max_retries: i32,
    dead_letter_enabled: bool,
}

impl RetryAccountant {
    pub fn new(store: Arc<dyn TaskStore>, max_retries: i32, dead_letter_enabled: bool) -> Self {
        Self {
            store,
            max_retries,
            dead_letter_enabled,
        }
    }

    /// Record a failed delivery against the claim identified by `lease_token`.
    /// A claim that was lost to the lease sweeper leaves the task untouched.
    #[tracing::instrument(skip(self, error))]
    pub async fn record(
        &self,
        task_id: i64,
        lease_token: i64,
        error: &str,
    ) -> StoreResult<RetryDecision> {
        match self
            .store
            .record_failure(task_id, lease_token, self.max_retries, error)
            .await?
        {
            RetryOutcome::Requeued { fail_count } => Ok(RetryDecision::Requeued { fail_count }),
            RetryOutcome::Exhausted if self.dead_letter_enabled => {
                if self.store.mark_dead(task_id, lease_token, error).await? {
                    Ok(RetryDecision::DeadLettered)
                } else {
                    Ok(RetryDecision::Unchanged)
                }
            }
            RetryOutcome::Exhausted => Ok(RetryDecision::Unchanged),
        }
    }
}
