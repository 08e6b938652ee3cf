// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! MindCanvas API Library
//!
//! HTTP surface over the credit ledger: accounts, credits, paid generation,
//! checkout and the Stripe webhook.

pub mod auth;
pub mod config;
pub mod error;
pub mod generation;
pub mod routes;
pub mod state;
pub mod telemetry;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
