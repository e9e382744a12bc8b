//! Task queue: dispatch worker pool, wake-on-insert, lease sweeper and submission.
//!
//! Shutdown: [`TaskQueue::shutdown`] stops every background task and waits for
//! workers to finish the batch they currently hold.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use mailq_core::models::{NewMailTask, Task};
use mailq_core::{Config, MailSender};
use mailq_db::db::task::NEW_TASK_CHANNEL;
use mailq_db::{StoreResult, TaskStore};

use crate::retry::{RetryAccountant, RetryDecision};

#[derive(Clone, Debug)]
pub struct TaskQueueConfig {
    pub worker_count: usize,
    pub batch_size: i64,
    pub max_retries: i32,
    pub poll_interval: Duration,
    pub delivery_timeout: Duration,
    /// `None` disables the lease sweeper.
    pub lease_timeout: Option<Duration>,
    pub reap_interval: Duration,
    pub dead_letter_enabled: bool,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            batch_size: 10,
            max_retries: 3,
            poll_interval: Duration::from_secs(1),
            delivery_timeout: Duration::from_secs(60),
            lease_timeout: Some(Duration::from_secs(600)),
            reap_interval: Duration::from_secs(60),
            dead_letter_enabled: true,
        }
    }
}

impl From<&Config> for TaskQueueConfig {
    fn from(config: &Config) -> Self {
        Self {
            worker_count: config.queue.worker_count,
            batch_size: config.queue.batch_size,
            max_retries: config.queue.max_retries,
            poll_interval: config.poll_interval(),
            delivery_timeout: config.delivery_timeout(),
            lease_timeout: config.lease_timeout(),
            reap_interval: config.reap_interval(),
            dead_letter_enabled: config.queue.dead_letter_enabled,
        }
    }
}

pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    config: TaskQueueConfig,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Start the worker pool and lease sweeper.
    ///
    /// If `pool` is `Some`, workers also wake on PostgreSQL NOTIFY so that
    /// tasks inserted by other processes are picked up without waiting for
    /// the poll interval.
    pub fn new(
        store: Arc<dyn TaskStore>,
        mailer: Arc<dyn MailSender>,
        config: TaskQueueConfig,
        pool: Option<sqlx::PgPool>,
    ) -> Self {
        let queue = Self::new_no_worker(store, config);
        let mut handles = Vec::with_capacity(queue.config.worker_count + 2);

        tracing::info!(
            worker_count = queue.config.worker_count,
            batch_size = queue.config.batch_size,
            max_retries = queue.config.max_retries,
            poll_interval_ms = queue.config.poll_interval.as_millis() as u64,
            listen_notify = pool.is_some(),
            "Mail dispatch worker pool started"
        );

        let accountant = RetryAccountant::new(
            queue.store.clone(),
            queue.config.max_retries,
            queue.config.dead_letter_enabled,
        );

        for worker_id in 0..queue.config.worker_count {
            let worker = Worker {
                id: worker_id,
                store: queue.store.clone(),
                mailer: mailer.clone(),
                accountant: accountant.clone(),
                wake: queue.wake.clone(),
                shutdown: queue.shutdown.clone(),
                batch_size: queue.config.batch_size,
                poll_interval: queue.config.poll_interval,
                delivery_timeout: queue.config.delivery_timeout,
            };
            handles.push(tokio::spawn(worker.run()));
        }

        if let Some(lease) = queue.config.lease_timeout {
            handles.push(tokio::spawn(run_lease_sweeper(
                queue.store.clone(),
                lease,
                queue.config.reap_interval,
                queue.shutdown.clone(),
            )));
        }

        if let Some(pool) = pool {
            handles.push(tokio::spawn(run_notify_listener(
                pool,
                queue.wake.clone(),
                queue.shutdown.clone(),
            )));
        }

        *queue.lock_handles() = handles;
        queue
    }

    /// Creates a TaskQueue that does not spawn any worker. Submitted tasks are
    /// stored and will be picked up by whichever pool serves the same store.
    pub fn new_no_worker(store: Arc<dyn TaskStore>, config: TaskQueueConfig) -> Self {
        Self {
            store,
            config,
            wake: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    /// Store a new pending task and wake one idle worker.
    #[tracing::instrument(skip(self, task), fields(recipient = %task.recipient))]
    pub async fn submit(&self, task: NewMailTask) -> StoreResult<i64> {
        let id = self
            .store
            .insert(&task.recipient, &task.subject, &task.body)
            .await?;
        self.wake.notify_one();
        Ok(id)
    }

    /// Put a dead task back in the pending pool with a fresh retry budget.
    #[tracing::instrument(skip(self))]
    pub async fn revive(&self, id: i64) -> StoreResult<Option<Task>> {
        let task = self.store.revive(id).await?;
        if task.is_some() {
            tracing::info!(task_id = id, "Dead task requeued by operator");
            self.wake.notify_one();
        }
        Ok(task)
    }

    /// Stop claiming, let workers finish their current batch and wait for
    /// every background task to exit.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating mail dispatch shutdown");
        self.shutdown.cancel();

        let handles = std::mem::take(&mut *self.lock_handles());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Mail dispatch worker pool stopped");
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Worker {
    id: usize,
    store: Arc<dyn TaskStore>,
    mailer: Arc<dyn MailSender>,
    accountant: RetryAccountant,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    batch_size: i64,
    poll_interval: Duration,
    delivery_timeout: Duration,
}

impl Worker {
    async fn run(self) {
        tracing::debug!(worker_id = self.id, "Worker started");

        while !self.shutdown.is_cancelled() {
            match self.store.claim_batch(self.batch_size).await {
                Ok(batch) if !batch.is_empty() => {
                    tracing::debug!(worker_id = self.id, count = batch.len(), "Processing batch");
                    for task in batch {
                        self.deliver(task).await;
                    }
                    continue;
                }
                Ok(_) => tracing::trace!(worker_id = self.id, "No pending tasks"),
                Err(e) => {
                    tracing::error!(worker_id = self.id, error = %e, "Failed to claim tasks");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = sleep(self.poll_interval) => {}
            }
        }

        tracing::debug!(worker_id = self.id, "Worker stopped");
    }

    /// Restart the lease clock before sending, so tasks further down a batch
    /// do not expire while earlier ones are delivered. A claim that was
    /// already taken back by the sweeper is skipped.
    async fn renew(&self, task: &Task) -> bool {
        match self.store.renew_lease(task.id, task.lease_token).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(task_id = task.id, "Claim lost before delivery, skipping task");
                false
            }
            Err(e) => {
                tracing::error!(task_id = task.id, error = %e, "Failed to renew claim, skipping task");
                false
            }
        }
    }

    #[tracing::instrument(skip(self, task), fields(worker_id = self.id, task_id = task.id))]
    async fn deliver(&self, task: Task) {
        if !self.renew(&task).await {
            return;
        }

        let result = tokio::time::timeout(
            self.delivery_timeout,
            self.mailer.send(&task.recipient, &task.subject, &task.body),
        )
        .await;

        let error = match result {
            Ok(Ok(())) => {
                match self.store.mark_sent(task.id, task.lease_token).await {
                    Ok(true) => tracing::info!(task_id = task.id, "Mail delivered"),
                    Ok(false) => tracing::warn!(
                        task_id = task.id,
                        "Mail delivered but the claim was taken over by another worker"
                    ),
                    Err(e) => tracing::error!(
                        task_id = task.id,
                        error = %e,
                        "Mail delivered but marking it sent failed"
                    ),
                }
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "Delivery timed out after {}s",
                self.delivery_timeout.as_secs_f64()
            ),
        };

        tracing::warn!(
            task_id = task.id,
            fail_count = task.fail_count,
            error = %error,
            "Mail delivery failed"
        );

        match self.accountant.record(task.id, task.lease_token, &error).await {
            Ok(RetryDecision::Requeued { fail_count }) => {
                tracing::info!(task_id = task.id, fail_count, "Task requeued for retry");
            }
            Ok(RetryDecision::DeadLettered) => {
                tracing::error!(task_id = task.id, error = %error, "Retries exhausted, task moved to dead");
            }
            Ok(RetryDecision::Unchanged) => {
                tracing::warn!(task_id = task.id, "Failure not recorded, task left unchanged");
            }
            Err(e) => {
                tracing::error!(task_id = task.id, error = %e, "Failed to record delivery failure");
            }
        }
    }
}

/// Periodically return tasks whose claim outlived `lease` to the pending pool.
/// The first pass runs immediately.
async fn run_lease_sweeper(
    store: Arc<dyn TaskStore>,
    lease: Duration,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                match store.requeue_expired(lease).await {
                    Ok(0) => {}
                    Ok(count) => tracing::warn!(count, lease_secs = lease.as_secs(), "Requeued tasks with expired leases"),
                    Err(e) => tracing::error!(error = %e, "Lease sweeper failed"),
                }
            }
        }
    }
}

/// Relay Postgres notifications for new tasks to idle workers. Reconnects on failure.
async fn run_notify_listener(pool: sqlx::PgPool, wake: Arc<Notify>, shutdown: CancellationToken) {
    loop {
        let mut listener = match sqlx::postgres::PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!(error = %e, "PgListener connect failed, will retry");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = sleep(Duration::from_secs(5)) => continue,
                }
            }
        };

        if let Err(e) = listener.listen(NEW_TASK_CHANNEL).await {
            tracing::warn!(error = %e, "LISTEN failed, will retry");
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(Duration::from_secs(5)) => continue,
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                notification = listener.recv() => match notification {
                    Ok(_) => wake.notify_one(),
                    Err(e) => {
                        tracing::warn!(error = %e, "LISTEN connection lost, reconnecting");
                        break;
                    }
                }
            }
        }
    }
}
