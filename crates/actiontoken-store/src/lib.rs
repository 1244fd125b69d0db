//! ActionToken Store - SQLite persistence for grants
//!
//! Validates every entity on save and leans on foreign keys for cascading
//! revocation.

pub mod sqlite;

pub use sqlite::{default_path, SqliteGrantStore};
