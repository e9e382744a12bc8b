//! mailq Infrastructure Layer
//!
//! Cross-cutting process setup shared by the binaries.

pub mod telemetry;

pub use telemetry::init_telemetry;
