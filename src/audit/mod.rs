//! Audit Storage Layer
//!
//! Trait-based storage for audit records with interchangeable backends:
//! - File (JSON array on disk)
//! - Relational (SQLite)
//! - Document (SurrealDB)
//!
//! plus a viewer that merges several backends into one list.

pub mod aggregator;
pub mod backend;
pub mod backends;
pub mod config;
pub mod entry;
pub mod factory;
pub mod filter;
pub mod logger;
pub mod schema;

pub use aggregator::{dedup_records, LogViewer, NullSink, RecordSink};
pub use backend::{AuditStorage, BackendType};
pub use config::{DocumentConfig, FileConfig, RelationalConfig, StorageConfig};
pub use entry::{AuditRecord, LogLevel, RecordId, RecordPatch};
pub use factory::create_storage;
pub use filter::{Include, PaginatedResult, QueryDescriptor, SortDirection};
pub use logger::AuditLogger;
pub use schema::{AssociationConfig, ExtensionField, FieldType, JoinTable, SchemaConfig};
