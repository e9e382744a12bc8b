use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use mailq_core::models::{Task, TaskStats, TaskStatus};

use super::store::{RetryOutcome, StoreError, StoreResult, TaskStore};

fn status_count(counts: &mut TaskStats, status: TaskStatus) -> &mut i64 {
    match status {
        TaskStatus::Pending => &mut counts.pending,
        TaskStatus::Processing => &mut counts.processing,
        TaskStatus::Sent => &mut counts.sent,
        TaskStatus::Dead => &mut counts.dead,
    }
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    tasks: BTreeMap<i64, Task>,
    /// Pending ids, so a claim never scans finished history.
    pending: BTreeSet<i64>,
    /// Sent and dead ids still held in `tasks`, oldest first.
    finished: VecDeque<i64>,
    /// Running totals. Evicted tasks stay counted.
    counts: TaskStats,
}

impl Inner {
    fn active(&self) -> usize {
        usize::try_from(self.counts.pending + self.counts.processing).unwrap_or(0)
    }

    fn holds(&self, id: i64, lease_token: i64, statuses: &[TaskStatus]) -> Option<&Task> {
        self.tasks
            .get(&id)
            .filter(|t| t.lease_token == lease_token && statuses.contains(&t.status))
    }

    /// Move a task to `to`, keeping counters and indexes in step.
    fn set_status(&mut self, id: i64, to: TaskStatus, now: DateTime<Utc>) -> Option<&mut Task> {
        let task = self.tasks.get_mut(&id)?;
        let from = task.status;
        task.status = to;
        task.updated_at = now;

        *status_count(&mut self.counts, from) -= 1;
        *status_count(&mut self.counts, to) += 1;

        if from == TaskStatus::Pending {
            self.pending.remove(&id);
        }
        if to == TaskStatus::Pending {
            self.pending.insert(id);
        }
        if from.is_terminal() {
            self.finished.retain(|finished| *finished != id);
        }
        if to.is_terminal() {
            self.finished.push_back(id);
        }
        Some(task)
    }

    fn evict_finished(&mut self, retain: usize) {
        while self.finished.len() > retain {
            if let Some(id) = self.finished.pop_front() {
                self.tasks.remove(&id);
            }
        }
    }
}

/// Non-durable task store. Every transition runs under one mutex, which gives
/// the same exclusivity as the Postgres claim.
///
/// Only pending and processing tasks count against `capacity`. Sent and dead
/// tasks stay readable until more than `retain_finished` of them have piled
/// up, then the oldest are dropped.
pub struct InMemoryTaskStore {
    inner: Mutex<Inner>,
    capacity: usize,
    retain_finished: usize,
}

impl InMemoryTaskStore {
    /// Store that keeps as many finished tasks as it accepts active ones.
    pub fn new(capacity: usize) -> Self {
        Self::with_retention(capacity, capacity)
    }

    pub fn with_retention(capacity: usize, retain_finished: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            retain_finished,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // No operation leaves the map half-updated, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, recipient: &str, subject: &str, body: &str) -> StoreResult<i64> {
        let mut inner = self.lock();
        if inner.active() >= self.capacity {
            tracing::warn!(capacity = self.capacity, "In-memory queue is full");
            return Err(StoreError::QueueFull {
                capacity: self.capacity,
            });
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let now = Utc::now();
        inner.tasks.insert(
            id,
            Task {
                id,
                recipient: recipient.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
                status: TaskStatus::Pending,
                fail_count: 0,
                last_error: None,
                claimed_at: None,
                lease_token: 0,
                created_at: now,
                updated_at: now,
            },
        );
        inner.pending.insert(id);
        inner.counts.total += 1;
        inner.counts.pending += 1;

        tracing::info!(task_id = id, "Mail task queued");
        Ok(id)
    }

    async fn claim_batch(&self, limit: i64) -> StoreResult<Vec<Task>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let now = Utc::now();
        let mut inner = self.lock();

        let ids: Vec<i64> = inner.pending.iter().take(limit).copied().collect();
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = inner.set_status(id, TaskStatus::Processing, now) {
                task.claimed_at = Some(now);
                task.lease_token += 1;
                claimed.push(task.clone());
            }
        }

        Ok(claimed)
    }

    async fn renew_lease(&self, id: i64, lease_token: i64) -> StoreResult<bool> {
        let mut inner = self.lock();
        if inner
            .holds(id, lease_token, &[TaskStatus::Processing])
            .is_none()
        {
            return Ok(false);
        }

        let now = Utc::now();
        if let Some(task) = inner.tasks.get_mut(&id) {
            task.claimed_at = Some(now);
            task.updated_at = now;
        }
        Ok(true)
    }

    async fn mark_sent(&self, id: i64, lease_token: i64) -> StoreResult<bool> {
        let mut inner = self.lock();
        if inner
            .holds(
                id,
                lease_token,
                &[TaskStatus::Processing, TaskStatus::Pending],
            )
            .is_none()
        {
            return Ok(false);
        }

        if let Some(task) = inner.set_status(id, TaskStatus::Sent, Utc::now()) {
            task.claimed_at = None;
        }
        inner.evict_finished(self.retain_finished);
        Ok(true)
    }

    async fn record_failure(
        &self,
        id: i64,
        lease_token: i64,
        retry_limit: i32,
        error: &str,
    ) -> StoreResult<RetryOutcome> {
        let mut inner = self.lock();
        let can_retry = inner
            .holds(id, lease_token, &[TaskStatus::Processing])
            .is_some_and(|task| task.can_retry(retry_limit));
        if !can_retry {
            return Ok(RetryOutcome::Exhausted);
        }

        match inner.set_status(id, TaskStatus::Pending, Utc::now()) {
            Some(task) => {
                task.fail_count += 1;
                task.last_error = Some(error.to_string());
                task.claimed_at = None;
                Ok(RetryOutcome::Requeued {
                    fail_count: task.fail_count,
                })
            }
            None => Ok(RetryOutcome::Exhausted),
        }
    }

    async fn mark_dead(&self, id: i64, lease_token: i64, error: &str) -> StoreResult<bool> {
        let mut inner = self.lock();
        if inner
            .holds(id, lease_token, &[TaskStatus::Processing])
            .is_none()
        {
            return Ok(false);
        }

        if let Some(task) = inner.set_status(id, TaskStatus::Dead, Utc::now()) {
            task.last_error = Some(error.to_string());
            task.claimed_at = None;
        }
        inner.evict_finished(self.retain_finished);
        Ok(true)
    }

    async fn requeue_expired(&self, lease: Duration) -> StoreResult<u64> {
        let Ok(lease) = chrono::Duration::from_std(lease) else {
            return Ok(0);
        };
        let now = Utc::now();
        let mut inner = self.lock();

        let expired: Vec<i64> = inner
            .tasks
            .values()
            .filter(|task| task.lease_expired(lease, now))
            .map(|task| task.id)
            .collect();

        for id in &expired {
            if let Some(task) = inner.set_status(*id, TaskStatus::Pending, now) {
                task.claimed_at = None;
            }
        }
        Ok(expired.len() as u64)
    }

    async fn get(&self, id: i64) -> StoreResult<Option<Task>> {
        Ok(self.lock().tasks.get(&id).cloned())
    }

    async fn stats(&self) -> StoreResult<TaskStats> {
        Ok(self.lock().counts)
    }

    async fn revive(&self, id: i64) -> StoreResult<Option<Task>> {
        let mut inner = self.lock();
        let is_dead = inner
            .tasks
            .get(&id)
            .is_some_and(|task| task.status == TaskStatus::Dead);
        if !is_dead {
            return Ok(None);
        }

        Ok(inner
            .set_status(id, TaskStatus::Pending, Utc::now())
            .map(|task| {
                task.fail_count = 0;
                task.last_error = None;
                task.clone()
            }))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn seeded(count: usize) -> InMemoryTaskStore {
        let store = InMemoryTaskStore::new(100);
        for i in 0..count {
            store
                .insert(&format!("user{}@x.com", i), "Hi", "Hello")
                .await
                .unwrap();
        }
        store
    }

    async fn claim_one(store: &InMemoryTaskStore) -> Task {
        store.claim_batch(1).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_claim_single_task() {
        let store = InMemoryTaskStore::new(10);
        let id = store.insert("a@x.com", "Hi", "Hello").await.unwrap();

        let batch = store.claim_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].recipient, "a@x.com");
        assert_eq!(batch[0].status, TaskStatus::Processing);
        assert_eq!(batch[0].lease_token, 1);
        assert!(batch[0].claimed_at.is_some());

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn test_claim_on_empty_queue() {
        let store = InMemoryTaskStore::new(10);
        assert!(store.claim_batch(10).await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap(), TaskStats::default());
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_bounded() {
        let store = seeded(5).await;
        let ids: Vec<i64> = store
            .claim_batch(3)
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let rest: Vec<i64> = store
            .claim_batch(10)
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(rest, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_failures_under_limit_requeue() {
        let store = seeded(1).await;
        for expected in 1..=2 {
            let task = claim_one(&store).await;
            let outcome = store
                .record_failure(task.id, task.lease_token, 3, "relay down")
                .await
                .unwrap();
            assert_eq!(outcome, RetryOutcome::Requeued { fail_count: expected });

            let stored = store.get(task.id).await.unwrap().unwrap();
            assert_eq!(stored.status, TaskStatus::Pending);
            assert_eq!(stored.last_error.as_deref(), Some("relay down"));
        }
        assert_eq!(store.claim_batch(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_at_limit_is_noop() {
        let store = seeded(1).await;
        for _ in 0..3 {
            let task = claim_one(&store).await;
            store
                .record_failure(task.id, task.lease_token, 3, "boom")
                .await
                .unwrap();
        }

        let task = claim_one(&store).await;
        assert_eq!(task.fail_count, 3);
        let outcome = store
            .record_failure(task.id, task.lease_token, 3, "boom")
            .await
            .unwrap();
        assert_eq!(outcome, RetryOutcome::Exhausted);

        let stored = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Processing);
        assert_eq!(stored.fail_count, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_disjoint() {
        let store = Arc::new(seeded(6).await);

        let a = tokio::spawn({
            let store = store.clone();
            async move { store.claim_batch(5).await.unwrap() }
        });
        let b = tokio::spawn({
            let store = store.clone();
            async move { store.claim_batch(5).await.unwrap() }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert!(a.len() + b.len() <= 6);
        for task in &a {
            assert!(b.iter().all(|other| other.id != task.id));
        }
    }

    #[tokio::test]
    async fn test_sent_is_terminal() {
        let store = seeded(1).await;
        let task = claim_one(&store).await;
        assert!(store.mark_sent(task.id, task.lease_token).await.unwrap());
        assert!(!store.mark_sent(task.id, task.lease_token).await.unwrap());

        assert_eq!(
            store
                .record_failure(task.id, task.lease_token, 3, "late")
                .await
                .unwrap(),
            RetryOutcome::Exhausted
        );
        assert!(!store.mark_dead(task.id, task.lease_token, "late").await.unwrap());
        assert!(!store.renew_lease(task.id, task.lease_token).await.unwrap());
        assert!(store.claim_batch(10).await.unwrap().is_empty());

        let stored = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Sent);
        assert_eq!(stored.fail_count, 0);
    }

    #[tokio::test]
    async fn test_dead_and_revive() {
        let store = seeded(1).await;
        let task = claim_one(&store).await;
        assert!(store.revive(task.id).await.unwrap().is_none());

        assert!(store
            .mark_dead(task.id, task.lease_token, "rejected")
            .await
            .unwrap());
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.total, 1);

        let revived = store.revive(task.id).await.unwrap().unwrap();
        assert_eq!(revived.status, TaskStatus::Pending);
        assert_eq!(revived.fail_count, 0);
        assert!(revived.last_error.is_none());
        assert!(store.revive(999).await.unwrap().is_none());

        let stats = store.stats().await.unwrap();
        assert_eq!((stats.pending, stats.dead), (1, 0));
        assert_eq!(claim_one(&store).await.id, task.id);
    }

    #[tokio::test]
    async fn test_requeue_expired_leases() {
        let store = seeded(2).await;
        store.claim_batch(1).await.unwrap();

        assert_eq!(store.requeue_expired(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(store.requeue_expired(Duration::ZERO).await.unwrap(), 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.processing, 0);
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_settle_reclaimed_task() {
        let store = seeded(1).await;
        let first = claim_one(&store).await;
        store.requeue_expired(Duration::ZERO).await.unwrap();
        let second = claim_one(&store).await;
        assert_eq!(second.id, first.id);
        assert_eq!(second.lease_token, first.lease_token + 1);

        assert!(!store.renew_lease(first.id, first.lease_token).await.unwrap());
        assert!(!store.mark_sent(first.id, first.lease_token).await.unwrap());
        assert_eq!(
            store
                .record_failure(first.id, first.lease_token, 3, "stale")
                .await
                .unwrap(),
            RetryOutcome::Exhausted
        );
        assert!(!store.mark_dead(first.id, first.lease_token, "stale").await.unwrap());

        let stored = store.get(first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Processing);
        assert_eq!(stored.fail_count, 0);

        assert!(store.renew_lease(second.id, second.lease_token).await.unwrap());
        assert!(store.mark_sent(second.id, second.lease_token).await.unwrap());
    }

    #[tokio::test]
    async fn test_requeued_task_can_still_be_settled_before_reclaim() {
        let store = seeded(1).await;
        let task = claim_one(&store).await;
        store.requeue_expired(Duration::ZERO).await.unwrap();

        assert!(!store.renew_lease(task.id, task.lease_token).await.unwrap());
        assert!(store.mark_sent(task.id, task.lease_token).await.unwrap());
        assert!(store.claim_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_renew_restarts_lease_clock() {
        let store = seeded(1).await;
        let task = claim_one(&store).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.renew_lease(task.id, task.lease_token).await.unwrap());
        assert_eq!(
            store.requeue_expired(Duration::from_millis(20)).await.unwrap(),
            0
        );
        let renewed = store.get(task.id).await.unwrap().unwrap();
        assert!(renewed.claimed_at > task.claimed_at);
    }

    #[tokio::test]
    async fn test_capacity_counts_active_tasks_only() {
        let store = InMemoryTaskStore::new(2);
        store.insert("a@x.com", "s", "b").await.unwrap();
        store.insert("b@x.com", "s", "b").await.unwrap();
        assert!(matches!(
            store.insert("c@x.com", "s", "b").await,
            Err(StoreError::QueueFull { capacity: 2 })
        ));

        let task = claim_one(&store).await;
        store.mark_sent(task.id, task.lease_token).await.unwrap();
        store.insert("c@x.com", "s", "b").await.unwrap();
    }

    #[tokio::test]
    async fn test_oldest_finished_tasks_are_evicted() {
        let store = InMemoryTaskStore::with_retention(10, 2);
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(
                store
                    .insert(&format!("user{}@x.com", i), "Hi", "Hello")
                    .await
                    .unwrap(),
            );
        }
        for task in store.claim_batch(4).await.unwrap() {
            store.mark_sent(task.id, task.lease_token).await.unwrap();
        }

        assert!(store.get(ids[0]).await.unwrap().is_none());
        assert!(store.get(ids[1]).await.unwrap().is_none());
        assert_eq!(
            store.get(ids[3]).await.unwrap().unwrap().status,
            TaskStatus::Sent
        );

        let stats = store.stats().await.unwrap();
        assert_eq!((stats.total, stats.sent, stats.pending), (4, 4, 0));
    }

    #[tokio::test]
    async fn test_revived_task_is_not_evicted() {
        let store = InMemoryTaskStore::with_retention(10, 1);
        store.insert("a@x.com", "Hi", "Hello").await.unwrap();
        store.insert("b@x.com", "Hi", "Hello").await.unwrap();

        let batch = store.claim_batch(2).await.unwrap();
        let (first, second) = (&batch[0], &batch[1]);
        store.mark_dead(first.id, first.lease_token, "rejected").await.unwrap();
        store.revive(first.id).await.unwrap().unwrap();

        // Would push the revived task out if it were still tracked as finished.
        store.mark_sent(second.id, second.lease_token).await.unwrap();

        let revived = store.get(first.id).await.unwrap().unwrap();
        assert_eq!(revived.status, TaskStatus::Pending);
    }
}
