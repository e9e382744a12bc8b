//! Test helpers: build AppState and router over the in-memory store.
//!
//! Run from workspace root: `cargo test -p mailq-api`.

#![allow(dead_code)]

use async_trait::async_trait;
use axum_test::TestServer;
use mailq_api::setup::routes;
use mailq_api::AppState;
use mailq_core::models::{Task, TaskStatus};
use mailq_core::{Config, MailError, MailSender};
use mailq_db::{InMemoryTaskStore, TaskStore};
use mailq_worker::{TaskQueue, TaskQueueConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Test application: server plus direct handles on the store and state.
pub struct TestApp {
    pub server: TestServer,
    pub store: Arc<InMemoryTaskStore>,
    pub state: Arc<AppState>,
}

impl TestApp {
    pub fn client(&self) -> &TestServer {
        &self.server
    }

    /// Poll until the task reaches `status`.
    pub async fn wait_for_status(&self, id: i64, status: TaskStatus) -> Task {
        for _ in 0..250 {
            if let Some(task) = self.store.get(id).await.unwrap() {
                if task.status == status {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {} never reached {}", id, status);
    }
}

pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("SMTP_HOST", "localhost"),
        ("SMTP_PORT", "2525"),
        ("SMTP_USER", "robot@example.com"),
        ("SMTP_PASS", "secret"),
        ("QUEUE_BACKEND", "memory"),
        ("QUEUE_MEMORY_CAPACITY", "100"),
        ("MAX_BODY_BYTES", "4096"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }

    let config = Config::from_source(|key| vars.get(key).cloned()).expect("test config");
    config.validate().expect("valid test config");
    config
}

fn memory_store(config: &Config) -> Arc<InMemoryTaskStore> {
    Arc::new(InMemoryTaskStore::with_retention(
        config.queue.memory_capacity,
        config.queue.memory_retain_finished,
    ))
}

fn build(config: Config, store: Arc<InMemoryTaskStore>, queue: TaskQueue) -> TestApp {
    let state = Arc::new(AppState::new(Arc::new(queue), config.clone()));
    let router = routes::setup_routes(&config, state.clone());
    let server = TestServer::new(router).expect("test server");
    TestApp {
        server,
        store,
        state,
    }
}

/// App whose queue accepts tasks but never dispatches them.
pub fn setup_test_app() -> TestApp {
    setup_test_app_with(&[])
}

pub fn setup_test_app_with(overrides: &[(&str, &str)]) -> TestApp {
    let config = test_config(overrides);
    let store = memory_store(&config);
    let queue = TaskQueue::new_no_worker(store.clone(), TaskQueueConfig::from(&config));
    build(config, store, queue)
}

/// App with a running worker pool delivering through `mailer`.
pub fn setup_dispatching_app(mailer: Arc<dyn MailSender>, max_retries: i32) -> TestApp {
    let config = test_config(&[]);
    let store = memory_store(&config);
    let queue_config = TaskQueueConfig {
        worker_count: 2,
        max_retries,
        poll_interval: Duration::from_millis(20),
        lease_timeout: None,
        ..TaskQueueConfig::from(&config)
    };
    let queue = TaskQueue::new(store.clone(), mailer, queue_config, None);
    build(config, store, queue)
}

/// Mail sender that records deliveries and can be told to fail.
pub struct RecordingMailer {
    pub failing: Mutex<bool>,
    pub calls: AtomicUsize,
    pub delivered: Mutex<Vec<(String, String, String)>>,
}

impl RecordingMailer {
    pub fn new(failing: bool) -> Arc<Self> {
        Arc::new(Self {
            failing: Mutex::new(failing),
            calls: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailSender for RecordingMailer {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), MailError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.failing.lock().unwrap() {
            return Err(MailError::Transport("550 mailbox unavailable".to_string()));
        }
        self.delivered.lock().unwrap().push((
            recipient.to_string(),
            subject.to_string(),
            body.to_string(),
        ));
        Ok(())
    }
}

pub fn mail_xml(to: &str, subject: &str, body: &str) -> String {
    format!(
        "<mail><to>{}</to><subject>{}</subject><body>{}</body></mail>",
        to, subject, body
    )
}
