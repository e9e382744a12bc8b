//! Task store implementations
//!
//! `store` defines the contract shared by the dispatcher and the API. `task`
//! is the durable Postgres backend, `memory` the bounded in-process one.

pub mod memory;
pub mod store;
pub mod task;
pub mod transaction;

/// Embedded schema migrations for the `mail_queue` table.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");
