//! Database lifecycle toolkit for the homedash dashboard.
//!
//! Everything here is synchronous and operates on one SQLite file at a
//! time: hot backups with retention, WAL checkpoints gated on an integrity
//! check, manifest-driven restores from a backup, and bulk revocation of
//! stored third-party tokens.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod tokens;

pub use error::{AppError, AppResult};
