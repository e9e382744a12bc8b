//! Shared application state.

use mailq_core::Config;
use mailq_db::TaskStore;
use mailq_worker::TaskQueue;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub queue: Arc<TaskQueue>,
    pub config: Config,
}

impl AppState {
    /// The queue must be serving `store`.
    pub fn new(queue: Arc<TaskQueue>, config: Config) -> Self {
        Self {
            store: queue.store().clone(),
            queue,
            config,
        }
    }
}
