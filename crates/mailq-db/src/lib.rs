//! mailq Database Layer
//!
//! Task store contract plus its Postgres and in-memory backends.

pub mod db;

pub use db::memory::InMemoryTaskStore;
pub use db::store::{RetryOutcome, StoreError, StoreResult, TaskStore};
pub use db::task::TaskRepository;
pub use db::transaction::TransactionGuard;
pub use db::MIGRATOR;
