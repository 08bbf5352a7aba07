//! Error-absorbing audit facade.
//!
//! Wraps a storage backend for callers that must never fail because of
//! auditing. Every backend error is logged and replaced by a neutral value.

use crate::audit::backend::AuditStorage;
use crate::audit::entry::{AuditRecord, RecordId, RecordPatch};
use crate::audit::filter::{PaginatedResult, QueryDescriptor};
use crate::core::Timestamp;
use crate::monitoring::ConsoleLogger;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

/// Audit logger over one storage backend.
pub struct AuditLogger {
    storage: Arc<dyn AuditStorage>,
    console: ConsoleLogger,
}

impl AuditLogger {
    /// Create a logger without console output.
    pub fn new(storage: Arc<dyn AuditStorage>) -> Self {
        Self {
            storage,
            console: ConsoleLogger::disabled(),
        }
    }

    /// Echo stored records through `console`.
    pub fn with_console(mut self, console: ConsoleLogger) -> Self {
        self.console = console;
        self
    }

    /// Underlying backend.
    pub fn storage(&self) -> &Arc<dyn AuditStorage> {
        &self.storage
    }

    /// Store a record. Returns `None` when storage failed.
    ///
    /// The record is echoed to the console whether or not the write succeeded.
    pub async fn log_event(&self, record: AuditRecord) -> Option<RecordId> {
        let mut echo = self.console.is_enabled().then(|| record.clone());
        let stored = match self.storage.log_event(record).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(error = %e, kind = ?e.kind(), "failed to log audit event");
                None
            }
        };
        if let Some(echo) = echo.as_mut() {
            if let Some(id) = &stored {
                echo.id = Some(id.clone());
            }
            self.console.log_event_to_console(echo);
        }
        stored
    }

    /// Paginated fetch; an empty page on error.
    pub async fn fetch_logs(&self, query: &QueryDescriptor) -> PaginatedResult {
        self.storage.fetch_logs(query).await.unwrap_or_else(|e| {
            error!(error = %e, "failed to fetch audit logs");
            PaginatedResult::empty(query)
        })
    }

    /// First matching record; `None` on error.
    pub async fn fetch_log(&self, query: &QueryDescriptor) -> Option<AuditRecord> {
        self.storage.fetch_log(query).await.unwrap_or_else(|e| {
            error!(error = %e, "failed to fetch audit log");
            None
        })
    }

    /// Apply a patch. Returns whether it was applied.
    pub async fn update_log(&self, id: &RecordId, patch: RecordPatch) -> bool {
        match self.storage.update_log(id, patch).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, id = %id, "failed to update audit log");
                false
            }
        }
    }

    /// Delete a record. Returns whether the backend succeeded.
    pub async fn delete_log(&self, id: &RecordId) -> bool {
        match self.storage.delete_log(id).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, id = %id, "failed to delete audit log");
                false
            }
        }
    }

    /// Retention sweep; `0` on error.
    pub async fn delete_logs_older_than(&self, threshold: Option<Timestamp>) -> u64 {
        self.storage
            .delete_logs_older_than(threshold)
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "failed to delete old audit logs");
                0
            })
    }

    /// Count matching records; `0` on error.
    pub async fn count_logs(&self, filter: &BTreeMap<String, Value>) -> u64 {
        self.storage.count_logs(filter).await.unwrap_or_else(|e| {
            error!(error = %e, "failed to count audit logs");
            0
        })
    }

    /// Full query; an empty page on error.
    pub async fn find_all(&self, query: &QueryDescriptor) -> PaginatedResult {
        self.storage.find_all(query).await.unwrap_or_else(|e| {
            error!(error = %e, "failed to query audit logs");
            PaginatedResult::empty(query)
        })
    }

    /// Every stored record; empty on error.
    pub async fn fetch_all_logs(&self) -> Vec<AuditRecord> {
        self.storage.fetch_all_logs().await.unwrap_or_else(|e| {
            error!(error = %e, "failed to fetch all audit logs");
            Vec::new()
        })
    }

    /// Table or collection name of the backend.
    pub fn table_name(&self) -> &str {
        self.storage.table_name()
    }
}
