//! REST API server module.
//!
//! Exposes stream lifecycle, consumer sessions and health over HTTP.

pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{ApiServer, AppState};
