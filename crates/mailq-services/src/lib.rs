//! mailq Services Layer
//!
//! Concrete implementations of the capabilities the dispatcher depends on.
//! Today that is SMTP delivery through a relay.

pub mod services;

pub use services::smtp::SmtpMailer;
