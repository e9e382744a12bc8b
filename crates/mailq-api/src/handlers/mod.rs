pub mod send;
pub mod tasks;
