// API crate clippy configuration (test code patterns)
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Subledger API Library
//!
//! HTTP surface for the billing engine: gateway webhooks, subscriber
//! operations and operator reads.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
