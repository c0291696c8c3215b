//! Database access for the reconciliation service
//!
//! One module per table, sqlx over the shared SQLite pool. The claim log
//! is append-only; records and identities are mutable projections.

pub mod claims;
pub mod identities;
pub mod kv;
pub mod records;
