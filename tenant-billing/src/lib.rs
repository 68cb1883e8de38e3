//! Billing status, webhook ingestion and plan quota enforcement for
//! multi-tenant organizations.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;

pub use error::BillingError;
pub use startup::{build_router, AppState, Application};
