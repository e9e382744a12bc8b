//! mailq Core Library
//!
//! This crate provides the domain models, error types, configuration and the mail
//! delivery capability shared by every mailq component.

pub mod config;
pub mod error;
pub mod mailer;
pub mod models;

// Re-export commonly used types
pub use config::{BaseConfig, Config, QueueBackend, QueueConfig, SmtpConfig, SmtpTls, LogFormat};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use mailer::{MailError, MailSender};
