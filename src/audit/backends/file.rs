//! File backend implementation.
//!
//! A single JSON array of self-describing records, read fully and rewritten
//! fully on every mutation.

use crate::audit::backend::{AuditStorage, BackendType};
use crate::audit::config::FileConfig;
use crate::audit::entry::{AuditRecord, RecordId, RecordPatch};
use crate::audit::filter::{compare_values, PaginatedResult, QueryDescriptor, SortDirection};
use crate::audit::schema::{RecordSchema, ResolvedInclude, SchemaConfig};
use crate::core::{default_retention_threshold, now, parse_timestamp, Error, Result, Timestamp};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

type Document = Map<String, Value>;

/// File backend.
///
/// Associations are looked up as keys on the stored objects; there is no
/// referential integrity. Mutations are serialized by an adapter-wide lock and
/// land through a temp file renamed over the target.
pub struct FileBackend {
    path: PathBuf,
    name: String,
    schema: RecordSchema,
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Create a new file backend.
    pub fn new(config: &FileConfig, schema: &SchemaConfig) -> Result<Self> {
        if config.path.as_os_str().is_empty() {
            return Err(Error::configuration("file backend requires a path"));
        }
        let schema = schema.validate()?;
        info!(path = %config.path.display(), "file audit backend ready");
        Ok(Self {
            name: config.path.display().to_string(),
            path: config.path.clone(),
            schema,
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<Document>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let parsed: Value = serde_json::from_str(&raw).map_err(|e| {
            Error::Persistence(format!("corrupt audit file {}: {e}", self.path.display()))
        })?;
        match parsed {
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(doc) => Ok(doc),
                    other => Err(Error::Persistence(format!(
                        "audit file {} holds a non-object entry: {other}",
                        self.path.display()
                    ))),
                })
                .collect(),
            _ => Err(Error::Persistence(format!(
                "audit file {} is not a JSON array",
                self.path.display()
            ))),
        }
    }

    /// Write the collection, skipping the write when nothing was or is stored.
    async fn store(&self, loaded_empty: bool, docs: Vec<Document>) -> Result<()> {
        if loaded_empty && docs.is_empty() {
            debug!(path = %self.path.display(), "skipping empty write");
            return Ok(());
        }
        let body = serde_json::to_vec_pretty(&Value::Array(
            docs.into_iter().map(Value::Object).collect(),
        ))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn matches(&self, doc: &Document, conditions: &[(String, Value)]) -> bool {
        conditions.iter().all(|(field, expected)| match doc.get(field) {
            None | Some(Value::Null) => expected.is_null(),
            Some(actual) => self.schema.normalize_stored(field, actual) == *expected,
        })
    }

    fn has_association(doc: &Document, include: &ResolvedInclude) -> bool {
        !matches!(
            doc.get(&include.association.name),
            None | Some(Value::Null)
        )
    }

    fn to_record(&self, doc: &Document, includes: &[ResolvedInclude]) -> Result<AuditRecord> {
        let mut record: AuditRecord = serde_json::from_value(Value::Object(doc.clone()))?;
        self.schema.retain_declared(&mut record);
        record.associations.clear();
        for include in includes {
            if let Some(value) = doc.get(&include.association.name) {
                record.associations.insert(
                    include.association.name.clone(),
                    project(value, &include.attributes),
                );
            }
        }
        Ok(record)
    }

    fn to_document(&self, record: &AuditRecord) -> Result<Document> {
        let mut stored = record.clone();
        let associations = std::mem::take(&mut stored.associations);
        let mut doc = match serde_json::to_value(&stored)? {
            Value::Object(doc) => doc,
            _ => return Err(Error::Persistence("record did not serialize to an object".into())),
        };
        for (name, value) in associations {
            if self.schema.associations().contains_key(&name) {
                doc.insert(name, value);
            }
        }
        Ok(doc)
    }

    async fn select(
        &self,
        query: &QueryDescriptor,
        includes: &[ResolvedInclude],
    ) -> Result<Vec<Document>> {
        let conditions = self.schema.normalize_filter(&query.where_)?;
        let mut docs: Vec<Document> = self
            .load()
            .await?
            .into_iter()
            .filter(|doc| self.matches(doc, &conditions))
            .filter(|doc| {
                includes
                    .iter()
                    .filter(|i| i.required)
                    .all(|i| Self::has_association(doc, i))
            })
            .collect();

        // Requested keys, then creation instant; remaining ties keep file order.
        let creation = ("createdAt".to_string(), SortDirection::Asc);
        docs.sort_by(|a, b| {
            query
                .order
                .iter()
                .chain(std::iter::once(&creation))
                .map(|(field, direction)| {
                    let left = a.get(field).map(|v| self.schema.normalize_stored(field, v));
                    let right = b.get(field).map(|v| self.schema.normalize_stored(field, v));
                    direction.apply(compare_values(left.as_ref(), right.as_ref()))
                })
                .find(|ordering| ordering.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(docs)
    }

    async fn paginate(
        &self,
        query: &QueryDescriptor,
        includes: &[ResolvedInclude],
    ) -> Result<PaginatedResult> {
        query.validate_paging()?;
        let docs = self.select(query, includes).await?;
        let total = docs.len() as u64;
        let data = docs
            .iter()
            .skip(usize::try_from(query.offset()).unwrap_or(usize::MAX))
            .take(usize::try_from(query.limit).unwrap_or(usize::MAX))
            .map(|doc| self.to_record(doc, includes))
            .collect::<Result<Vec<_>>>()?;
        Ok(PaginatedResult {
            data,
            total,
            page: query.page,
            limit: query.limit,
        })
    }
}

/// Keep only `attributes` of an object, or of each object in an array.
fn project(value: &Value, attributes: &[String]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| attributes.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| project(v, attributes)).collect()),
        other => other.clone(),
    }
}

fn doc_id(doc: &Document) -> Option<&str> {
    doc.get("id").and_then(Value::as_str)
}

#[async_trait]
impl AuditStorage for FileBackend {
    async fn log_event(&self, mut record: AuditRecord) -> Result<RecordId> {
        let _guard = self.write_lock.lock().await;
        let mut docs = self.load().await?;
        let loaded_empty = docs.is_empty();

        self.schema.apply_extensions(&mut record);
        let id = record.id.clone().unwrap_or_else(RecordId::generate);
        if docs.iter().any(|doc| doc_id(doc) == Some(id.as_str())) {
            return Err(Error::DuplicateId(id.to_string()));
        }
        record.id = Some(id.clone());
        record.created_at.get_or_insert_with(now);

        docs.push(self.to_document(&record)?);
        self.store(loaded_empty, docs).await?;
        debug!(id = %id, action = %record.action, "file record written");
        Ok(id)
    }

    async fn fetch_logs(&self, query: &QueryDescriptor) -> Result<PaginatedResult> {
        self.paginate(&query.without_include_and_order(), &[]).await
    }

    async fn fetch_log(&self, query: &QueryDescriptor) -> Result<Option<AuditRecord>> {
        let includes = self.schema.resolve_includes(&query.include)?;
        let mut unordered = query.clone();
        unordered.order.clear();
        let docs = self.select(&unordered, &includes).await?;
        docs.first()
            .map(|doc| self.to_record(doc, &includes))
            .transpose()
    }

    async fn update_log(&self, id: &RecordId, patch: RecordPatch) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut docs = self.load().await?;
        let Some(index) = docs.iter().position(|doc| doc_id(doc) == Some(id.as_str())) else {
            debug!(id = %id, "update of missing file record ignored");
            return Ok(());
        };

        let mut record = self.to_record(&docs[index], &[])?;
        patch.apply_to(&mut record);
        self.schema.apply_extensions(&mut record);

        let doc = &mut docs[index];
        doc.remove("timestamp");
        doc.remove("metadata");
        doc.extend(self.to_document(&record)?);
        self.store(false, docs).await
    }

    async fn delete_log(&self, id: &RecordId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut docs = self.load().await?;
        let before = docs.len();
        docs.retain(|doc| doc_id(doc) != Some(id.as_str()));
        if docs.len() == before {
            return Ok(());
        }
        self.store(false, docs).await
    }

    async fn delete_logs_older_than(&self, threshold: Option<Timestamp>) -> Result<u64> {
        let threshold = threshold.unwrap_or_else(default_retention_threshold);
        let _guard = self.write_lock.lock().await;
        let mut docs = self.load().await?;
        let before = docs.len();
        docs.retain(|doc| {
            doc.get("createdAt")
                .and_then(Value::as_str)
                .and_then(parse_timestamp)
                .map_or(true, |created| created >= threshold)
        });
        let removed = (before - docs.len()) as u64;
        if removed > 0 {
            self.store(false, docs).await?;
            info!(removed, path = %self.path.display(), "pruned file audit records");
        }
        Ok(removed)
    }

    async fn count_logs(&self, filter: &BTreeMap<String, Value>) -> Result<u64> {
        let conditions = self.schema.normalize_filter(filter)?;
        Ok(self
            .load()
            .await?
            .iter()
            .filter(|doc| self.matches(doc, &conditions))
            .count() as u64)
    }

    async fn find_all(&self, query: &QueryDescriptor) -> Result<PaginatedResult> {
        self.schema.check_order(&query.order)?;
        let includes = self.schema.resolve_includes(&query.include)?;
        self.paginate(query, &includes).await
    }

    async fn fetch_all_logs(&self) -> Result<Vec<AuditRecord>> {
        self.load()
            .await?
            .iter()
            .map(|doc| self.to_record(doc, &[]))
            .collect()
    }

    fn table_name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> BackendType {
        BackendType::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::backends::conformance;
    use crate::audit::entry::LogLevel;
    use crate::audit::filter::{Include, SortDirection};
    use crate::audit::schema::AssociationConfig;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn backend_in(dir: &TempDir, schema: &SchemaConfig) -> FileBackend {
        let config = FileConfig {
            path: dir.path().join("audit.json"),
        };
        FileBackend::new(&config, schema).unwrap()
    }

    #[tokio::test]
    async fn test_file_conformance() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_in(&dir, &conformance::schema());
        conformance::run_all(&backend).await;
    }

    #[tokio::test]
    async fn test_file_backend_creation() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_in(&dir, &SchemaConfig::default());
        assert_eq!(backend.backend_type(), BackendType::File);
        assert!(backend.table_name().ends_with("audit.json"));
        assert!(FileBackend::new(&FileConfig { path: PathBuf::new() }, &SchemaConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty_and_is_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_in(&dir, &SchemaConfig::default());

        assert!(backend.fetch_all_logs().await.unwrap().is_empty());
        backend.delete_log(&RecordId::new("nope")).await.unwrap();
        assert_eq!(backend.delete_logs_older_than(None).await.unwrap(), 0);
        assert!(!backend.path().exists());
    }

    #[tokio::test]
    async fn test_deleting_last_record_writes_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_in(&dir, &SchemaConfig::default());

        let id = backend
            .log_event(AuditRecord::new("u1", "LOGIN", LogLevel::Info))
            .await
            .unwrap();
        backend.delete_log(&id).await.unwrap();

        let raw = std::fs::read_to_string(backend.path()).unwrap();
        assert_eq!(serde_json::from_str::<Value>(&raw).unwrap(), json!([]));
        assert!(backend.fetch_log(&QueryDescriptor::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_in(&dir, &SchemaConfig::default());
        std::fs::write(backend.path(), "{not json").unwrap();

        let err = backend.fetch_all_logs().await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        assert!(backend
            .log_event(AuditRecord::new("u1", "LOGIN", LogLevel::Info))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_file_is_self_describing_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_in(&dir, &SchemaConfig::default());
        backend
            .log_event(
                AuditRecord::new("u1", "LOGIN", LogLevel::Warn)
                    .with_id("a1")
                    .with_metadata_field("ip", "10.0.0.1"),
            )
            .await
            .unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(backend.path()).unwrap()).unwrap();
        let first = &raw.as_array().unwrap()[0];
        assert_eq!(first["id"], "a1");
        assert_eq!(first["userId"], "u1");
        assert_eq!(first["logLevel"], "WARN");
        assert_eq!(first["metadata"]["ip"], "10.0.0.1");
        assert!(first["createdAt"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn test_include_reads_embedded_keys() {
        let dir = tempfile::tempdir().unwrap();
        let schema = SchemaConfig::new().with_association(
            "user",
            AssociationConfig::belongs_to("userId").with_fields(&["username", "email"]),
        );
        let backend = backend_in(&dir, &schema);

        let mut with_user = AuditRecord::new("u1", "LOGIN", LogLevel::Info);
        with_user.associations.insert(
            "user".to_string(),
            json!({"id": "u1", "username": "ada", "email": "ada@example.com"}),
        );
        backend.log_event(with_user).await.unwrap();
        backend
            .log_event(AuditRecord::new("u2", "LOGIN", LogLevel::Info))
            .await
            .unwrap();

        let query = QueryDescriptor::new().include(Include::new("user").required().attributes(&["username"]));
        let page = backend.find_all(&query).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.data[0].associations["user"], json!({"username": "ada"}));

        let optional = backend
            .find_all(&QueryDescriptor::new().include(Include::new("user")))
            .await
            .unwrap();
        assert_eq!(optional.total, 2);

        // fetch_logs never populates associations
        let plain = backend.fetch_logs(&query).await.unwrap();
        assert_eq!(plain.total, 2);
        assert!(plain.data.iter().all(|r| r.associations.is_empty()));
    }

    #[tokio::test]
    async fn test_find_all_orders_with_stable_ties() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_in(&dir, &SchemaConfig::default());
        for (user, action) in [("b", "1"), ("a", "2"), ("b", "3"), ("a", "4")] {
            backend
                .log_event(AuditRecord::new(user, action, LogLevel::Info))
                .await
                .unwrap();
        }

        let page = backend
            .find_all(&QueryDescriptor::new().order_by("userId", SortDirection::Desc))
            .await
            .unwrap();
        let actions: Vec<_> = page.data.iter().map(|r| r.action.as_str()).collect();
        assert_eq!(actions, vec!["1", "3", "2", "4"]);
    }

    #[tokio::test]
    async fn test_concurrent_writes_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let backend = std::sync::Arc::new(backend_in(&dir, &SchemaConfig::default()));

        let writes = (0..20).map(|i| {
            let backend = backend.clone();
            async move {
                backend
                    .log_event(AuditRecord::new(&format!("u{i}"), "LOGIN", LogLevel::Info))
                    .await
            }
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }

        assert_eq!(backend.count_logs(&BTreeMap::new()).await.unwrap(), 20);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn prop_pagination_partitions_records(n in 0usize..25, limit in 1u64..7) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let dir = tempfile::tempdir().unwrap();
                let backend = backend_in(&dir, &SchemaConfig::default());
                for i in 0..n {
                    backend
                        .log_event(AuditRecord::new("u", &format!("A{i}"), LogLevel::Info))
                        .await
                        .unwrap();
                }

                let pages = (n as u64).div_ceil(limit) + 1;
                let mut seen = Vec::new();
                for page in 1..=pages {
                    let result = backend
                        .fetch_logs(&QueryDescriptor::new().page(page).limit(limit))
                        .await
                        .unwrap();
                    assert_eq!(result.total, n as u64);
                    assert!(result.data.len() as u64 <= limit);
                    seen.extend(result.data.into_iter().map(|r| r.action));
                }
                let expected: Vec<_> = (0..n).map(|i| format!("A{i}")).collect();
                assert_eq!(seen, expected);
            });
        }
    }
}
