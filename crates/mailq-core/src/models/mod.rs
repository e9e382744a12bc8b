//! Domain models for queued mail tasks and intake requests.

pub mod mail;
pub mod task;

pub use mail::MailRequest;
pub use task::{NewMailTask, Task, TaskResponse, TaskStats, TaskStatus};
