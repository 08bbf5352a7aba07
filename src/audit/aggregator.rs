//! Multi-backend log viewer.
//!
//! Queries several backends concurrently and merges their pages into one
//! de-duplicated list.

use crate::audit::backend::AuditStorage;
use crate::audit::entry::{AuditRecord, RecordId};
use crate::audit::filter::QueryDescriptor;
use crate::core::{Result, Timestamp};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Receiver for records emitted by the viewer.
pub trait RecordSink: Send + Sync {
    /// Called once per kept record, in final order.
    fn emit(&self, record: &AuditRecord);
}

/// Sink that drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl RecordSink for NullSink {
    fn emit(&self, _record: &AuditRecord) {}
}

/// Aggregating viewer over an ordered list of backends.
pub struct LogViewer {
    storages: Vec<Arc<dyn AuditStorage>>,
    sink: Arc<dyn RecordSink>,
}

impl LogViewer {
    /// Create a viewer. Backend order decides which duplicate is kept.
    pub fn new(storages: Vec<Arc<dyn AuditStorage>>, sink: Arc<dyn RecordSink>) -> Self {
        Self { storages, sink }
    }

    /// Number of backends.
    pub fn len(&self) -> usize {
        self.storages.len()
    }

    /// Whether the viewer has no backends.
    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }

    /// Fetch the page from every backend and merge it.
    ///
    /// Each backend's `fetch_logs` result is trusted as-is; no filtering is
    /// reapplied. The first backend error is returned.
    pub async fn view_logs(&self, query: &QueryDescriptor) -> Result<Vec<AuditRecord>> {
        let pages = join_all(self.storages.iter().map(|s| s.fetch_logs(query))).await;

        let mut merged = Vec::new();
        for (storage, page) in self.storages.iter().zip(pages) {
            let page = page?;
            debug!(
                backend = %storage.backend_type(),
                table = storage.table_name(),
                records = page.data.len(),
                "backend page fetched"
            );
            merged.extend(page.data);
        }

        let unique = dedup_records(merged);
        for record in &unique {
            self.sink.emit(record);
        }
        Ok(unique)
    }
}

/// Drop records that duplicate an earlier kept record.
///
/// Two records are duplicates when their ids match and either their
/// timestamps are equal or one of them has none. The first occurrence wins.
pub fn dedup_records(records: Vec<AuditRecord>) -> Vec<AuditRecord> {
    let mut kept_times: HashMap<RecordId, Vec<Option<Timestamp>>> = HashMap::new();
    let mut unique = Vec::with_capacity(records.len());

    for record in records {
        let Some(id) = record.id.clone() else {
            unique.push(record);
            continue;
        };
        let times = kept_times.entry(id).or_default();
        let duplicate = times.iter().any(|kept| match (kept, &record.timestamp) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        });
        if !duplicate {
            times.push(record.timestamp);
            unique.push(record);
        }
    }
    unique
}
