//! Storage factory.
//!
//! Builds a storage backend from configuration.

use crate::audit::backend::{AuditStorage, BackendType};
use crate::audit::backends::{DocumentBackend, FileBackend, SqlBackend};
use crate::audit::config::StorageConfig;
use crate::core::Result;
use std::sync::Arc;
use tracing::info;

/// Create a storage backend from configuration.
///
/// A missing backend section falls back to that backend's defaults.
pub async fn create_storage(config: &StorageConfig) -> Result<Arc<dyn AuditStorage>> {
    config.schema.validate()?;

    let storage: Arc<dyn AuditStorage> = match config.backend {
        BackendType::File => {
            let file_config = config.file.clone().unwrap_or_default();
            Arc::new(FileBackend::new(&file_config, &config.schema)?)
        }
        BackendType::Relational => {
            let sql_config = config.relational.clone().unwrap_or_default();
            Arc::new(SqlBackend::new(&sql_config, &config.schema).await?)
        }
        BackendType::Document => {
            let doc_config = config.document.clone().unwrap_or_default();
            Arc::new(DocumentBackend::new(&doc_config, &config.schema).await?)
        }
    };

    info!(
        backend = %storage.backend_type(),
        table = storage.table_name(),
        "audit storage ready"
    );
    Ok(storage)
}
