//! live-relay library crate.
//!
//! Supervises live camera ingestion and multiplexes each source to many
//! viewers through a media routing boundary.

pub mod api;
pub mod config;
pub mod consumer;
pub mod controller;
pub mod domain;
pub mod error;
pub mod health;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod persistence;
pub mod relay;
pub mod router;

pub use error::{Error, Result};
pub use relay::Relay;
