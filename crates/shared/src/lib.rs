//! Shared infrastructure for the Subledger binaries
//!
//! Database pool construction, embedded migrations and tracing setup.

pub mod db;
pub mod telemetry;

pub use db::{create_pool, run_migrations};
pub use telemetry::init_tracing;
