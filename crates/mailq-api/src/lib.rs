//! mailq API Library
//!
//! HTTP intake for new mail, operator endpoints over the task store, and
//! application setup.

mod api_doc;
mod handlers;

pub mod error;
pub mod setup;
pub mod state;

pub use api_doc::ApiDoc;
pub use error::{ErrorResponse, HttpAppError};
pub use state::AppState;
