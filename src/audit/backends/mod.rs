//! Audit storage backend implementations.
//!
//! Three interchangeable backends:
//! - File (single JSON array)
//! - Relational (SQLite via sqlx)
//! - Document (SurrealDB)

pub mod document;
pub mod file;
pub mod relational;

#[cfg(test)]
pub(crate) mod conformance;

pub use document::DocumentBackend;
pub use file::FileBackend;
pub use relational::SqlBackend;
