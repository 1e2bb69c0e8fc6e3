//! Relational store boundary.

mod backend;
pub mod sanitize;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use backend::{DatabaseBackend, RecordId, Row};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
