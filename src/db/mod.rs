//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into those models.
//!
//! External modules should import from `medbatch::db`; the repository API
//! and commonly used models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{EntryForAnalysis, NewMedicine, StoredEntry};
