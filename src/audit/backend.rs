//! AuditStorage trait definition.
//!
//! Core contract every audit storage backend implements.

use crate::audit::entry::{AuditRecord, RecordId, RecordPatch};
use crate::audit::filter::{PaginatedResult, QueryDescriptor};
use crate::core::{Result, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Backend type identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// JSON array in a single file
    File,
    /// SQL table (SQLite via sqlx)
    Relational,
    /// Document collection (SurrealDB)
    Document,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendType::File => write!(f, "file"),
            BackendType::Relational => write!(f, "relational"),
            BackendType::Document => write!(f, "document"),
        }
    }
}

/// Core trait for audit storage backends.
///
/// Every backend gives identical CRUD, filtering, pagination and retention
/// semantics. Missing ids are not errors: `fetch_log` returns `None`,
/// `update_log` and `delete_log` do nothing.
#[async_trait]
pub trait AuditStorage: Send + Sync {
    /// Persist a new record with the configured extension fields merged in.
    ///
    /// Returns the assigned ID.
    async fn log_event(&self, record: AuditRecord) -> Result<RecordId>;

    /// Records matching `where`, paginated. `include` and `order` are ignored.
    async fn fetch_logs(&self, query: &QueryDescriptor) -> Result<PaginatedResult>;

    /// First record matching `where`/`include`, if any.
    async fn fetch_log(&self, query: &QueryDescriptor) -> Result<Option<AuditRecord>>;

    /// Apply a partial update; extension fields are re-merged.
    async fn update_log(&self, id: &RecordId, patch: RecordPatch) -> Result<()>;

    /// Delete a record by ID.
    async fn delete_log(&self, id: &RecordId) -> Result<()>;

    /// Delete records created strictly before `threshold`
    /// (default: now minus three months). Returns the number removed.
    async fn delete_logs_older_than(&self, threshold: Option<Timestamp>) -> Result<u64>;

    /// Count records matching `where`.
    async fn count_logs(&self, filter: &BTreeMap<String, Value>) -> Result<u64>;

    /// Like `fetch_logs`, honouring `include` and `order`.
    async fn find_all(&self, query: &QueryDescriptor) -> Result<PaginatedResult>;

    /// Every record in creation order.
    async fn fetch_all_logs(&self) -> Result<Vec<AuditRecord>>;

    /// Logical table/collection identifier.
    fn table_name(&self) -> &str;

    /// Get the backend type.
    fn backend_type(&self) -> BackendType;
}
