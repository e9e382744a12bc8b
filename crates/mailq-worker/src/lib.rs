//! mailq Worker
//!
//! Fixed-size pool of dispatch workers that claim batches from a
//! [`TaskStore`](mailq_db::TaskStore), hand each task to a
//! [`MailSender`](mailq_core::MailSender) and report the outcome back.

pub mod queue;
pub mod retry;

pub use queue::{TaskQueue, TaskQueueConfig};
pub use retry::{RetryAccountant, RetryDecision};
