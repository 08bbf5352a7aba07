//! # audit-trail
//!
//! Pluggable audit-event storage:
//! - **Backends**: file, relational (SQLite) and document (SurrealDB)
//!   behind one async [`AuditStorage`](audit::AuditStorage) contract
//! - **Queries**: exact-match filters, includes, ordering and pagination
//! - **Viewer**: concurrent multi-backend reads with de-duplication
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use audit_trail::audit::{create_storage, AuditRecord, LogLevel, QueryDescriptor, StorageConfig};
//!
//! #[tokio::main]
//! async fn main() -> audit_trail::Result<()> {
//!     let storage = create_storage(&StorageConfig::file("audit_logs.json")).await?;
//!     storage.log_event(AuditRecord::new("u1", "LOGIN", LogLevel::Info)).await?;
//!
//!     let page = storage.fetch_logs(&QueryDescriptor::new().filter("userId", "u1")).await?;
//!     println!("{} records", page.total);
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod core;
pub mod monitoring;

pub use core::error::{Error, Result};
