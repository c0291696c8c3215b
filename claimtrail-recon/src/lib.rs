//! claimtrail-recon - Claim reconciliation service
//!
//! Reconciles external identity-profile work lists against the local
//! append-only claim log and projects the result into per-record
//! verified/unverified claim matrices.
//!
//! Layout:
//! - `names`, `matcher`, `matrix`: name normalization, fuzzy
//!   author-position matching, and the claim-matrix updater
//! - `diff`, `harvest`: profile reconciliation and identity fact
//!   harvesting, written against the service seams in `services`
//! - `pipeline`: the staged poll/fetch/ingest/match service
//! - `driver`, `importer`: one-shot batch runs and bulk claim import
//! - `db`: sqlx access to the claim log, identities, records, and
//!   checkpoints
//! - `api`: the read-only HTTP status surface

pub mod api;
pub mod db;
pub mod diff;
pub mod driver;
pub mod emit;
pub mod error;
pub mod harvest;
pub mod importer;
pub mod matcher;
pub mod matrix;
pub mod models;
pub mod names;
pub mod pipeline;
pub mod services;

pub use error::{TaskError, TaskResult};
