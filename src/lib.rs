//! Payment gateway orchestration for the storefront: hosted checkout,
//! callback and webhook processing, refunds, cancellations and expiry.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
