//! Shared infrastructure for the claimtrail services
//!
//! Error types, configuration loading, timestamp utilities, and database
//! bootstrap used by the reconciliation pipeline.

pub mod config;
pub mod db;
pub mod error;
pub mod time;

pub use error::{Error, Result};
