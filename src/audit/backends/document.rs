//! Document backend implementation.
//!
//! One SurrealDB collection per deployment, defined lazily on first use.
//! Supports embedded (`mem://`) and remote (`ws://`) endpoints.
//!
//! `total` comes from a count statement issued before the page fetch; the two
//! are not snapshot-consistent, so a concurrent write between them can make
//! `total` disagree with the page.

use crate::audit::backend::{AuditStorage, BackendType};
use crate::audit::config::DocumentConfig;
use crate::audit::entry::{AuditRecord, RecordId, RecordPatch};
use crate::audit::filter::{PaginatedResult, QueryDescriptor, SortDirection};
use crate::audit::schema::{
    ensure_identifier, FieldType, Link, RecordSchema, ResolvedInclude, SchemaConfig,
    SchemaRegistry,
};
use crate::core::{
    canonical_timestamp, default_retention_threshold, now, Error, Result, Timestamp,
};
use async_trait::async_trait;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use surrealdb::engine::any::{connect, Any};
use surrealdb::opt::auth::Root;
use surrealdb::opt::QueryResult;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Projection alias carrying the match key in population lookups.
const KEY_ALIAS: &str = "__key";

/// Statements that define one collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionDefinition {
    /// Collection name
    pub collection: String,
    /// `DEFINE ... IF NOT EXISTS` statements
    pub statements: Vec<String>,
}

impl CollectionDefinition {
    fn new(collection: &str, schema: &RecordSchema) -> Self {
        let table = escape(collection);
        let mut statements = vec![format!("DEFINE TABLE IF NOT EXISTS {table} SCHEMALESS")];

        let mut fields: Vec<(String, String)> = vec![
            ("userId".to_string(), "string".to_string()),
            ("action".to_string(), "string".to_string()),
            ("logLevel".to_string(), "string".to_string()),
            ("timestamp".to_string(), "option<string>".to_string()),
            ("createdAt".to_string(), "string".to_string()),
        ];
        fields.extend(
            schema
                .extensions()
                .iter()
                .filter(|f| f.field_type != FieldType::Json)
                .map(|f| (f.name.clone(), format!("option<{}>", f.field_type.document_type()))),
        );
        statements.extend(fields.into_iter().map(|(name, kind)| {
            format!(
                "DEFINE FIELD IF NOT EXISTS {} ON TABLE {table} TYPE {kind}",
                escape(&name)
            )
        }));
        statements.push(format!(
            "DEFINE INDEX IF NOT EXISTS {} ON TABLE {table} FIELDS {}",
            escape(&format!("idx_{collection}_createdAt")),
            escape("createdAt")
        ));

        Self {
            collection: collection.to_string(),
            statements,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CountRow {
    total: u64,
}

/// A statement under construction plus its bound parameters.
#[derive(Default)]
struct Statement {
    conditions: Vec<String>,
    params: Vec<(String, Value)>,
}

impl Statement {
    fn bind(&mut self, value: Value) -> String {
        let name = format!("p{}", self.params.len());
        self.params.push((name.clone(), value));
        format!("${name}")
    }

    fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" AND "))
        }
    }
}

/// Document backend over a SurrealDB client.
pub struct DocumentBackend {
    db: Surreal<Any>,
    collection: String,
    schema: RecordSchema,
    registry: SchemaRegistry<CollectionDefinition>,
}

impl DocumentBackend {
    /// Connect and create the backend.
    pub async fn new(config: &DocumentConfig, schema: &SchemaConfig) -> Result<Self> {
        let db = connect_client(config).await?;
        let backend = Self::with_client(db, &config.collection, schema)?;
        info!(
            endpoint = %config.endpoint,
            collection = %config.collection,
            "document audit backend ready"
        );
        Ok(backend)
    }

    /// Create a backend on an existing (possibly shared) client.
    pub fn with_client(db: Surreal<Any>, collection: &str, schema: &SchemaConfig) -> Result<Self> {
        ensure_identifier("collection", collection)?;
        Ok(Self {
            db,
            collection: collection.to_string(),
            schema: schema.validate()?,
            registry: SchemaRegistry::new(),
        })
    }

    /// Underlying client.
    pub fn client(&self) -> &Surreal<Any> {
        &self.db
    }

    /// Defined collection schema, if the collection has been used.
    pub async fn definition(&self) -> Option<std::sync::Arc<CollectionDefinition>> {
        self.registry.get(&self.collection).await
    }

    async fn ensure_collection(&self) -> Result<()> {
        self.registry
            .get_or_define(&self.collection, || async {
                let definition = CollectionDefinition::new(&self.collection, &self.schema);
                self.db
                    .query(definition.statements.join(";\n"))
                    .await?
                    .check()?;
                debug!(collection = %self.collection, "document collection defined");
                Ok(definition)
            })
            .await
            .map(|_| ())
    }

    fn field_expr(field: &str) -> String {
        if field == "id" {
            "record::id(id)".to_string()
        } else {
            escape(field)
        }
    }

    fn projection(&self) -> String {
        let mut fields = vec!["record::id(id) AS id".to_string()];
        fields.extend(
            self.schema
                .columns()
                .iter()
                .filter(|c| c.as_str() != "id")
                .map(|c| escape(c)),
        );
        fields.join(", ")
    }

    fn build_where(
        &self,
        conditions: &[(String, Value)],
        includes: &[ResolvedInclude],
    ) -> Statement {
        let mut statement = Statement::default();
        statement.params.push(("table".to_string(), Value::String(self.collection.clone())));

        for (field, value) in conditions {
            let expr = Self::field_expr(field);
            let condition = if value.is_null() {
                format!("({expr} = NONE OR {expr} = NULL)")
            } else {
                let param = statement.bind(value.clone());
                format!("{expr} = {param}")
            };
            statement.conditions.push(condition);
        }

        for include in includes.iter().filter(|i| i.required) {
            let condition = membership_predicate(&mut statement, include);
            statement.conditions.push(condition);
        }
        statement
    }

    async fn run<T>(&self, sql: String, params: Vec<(String, Value)>) -> Result<T>
    where
        T: DeserializeOwned,
        usize: QueryResult<T>,
    {
        let mut query = self.db.query(sql);
        for param in params {
            query = query.bind(param);
        }
        let mut response = query.await?;
        Ok(response.take(0)?)
    }

    async fn count_where(
        &self,
        conditions: &[(String, Value)],
        includes: &[ResolvedInclude],
    ) -> Result<u64> {
        let statement = self.build_where(conditions, includes);
        let sql = format!(
            "SELECT count() AS total FROM type::table($table){} GROUP ALL",
            statement.where_clause()
        );
        let row: Option<CountRow> = self.run(sql, statement.params).await?;
        Ok(row.map_or(0, |r| r.total))
    }

    async fn select_records(
        &self,
        conditions: &[(String, Value)],
        includes: &[ResolvedInclude],
        order: &[(String, SortDirection)],
        window: Option<(u64, u64)>,
    ) -> Result<Vec<AuditRecord>> {
        let statement = self.build_where(conditions, includes);
        let mut keys: Vec<String> = order
            .iter()
            .map(|(field, direction)| format!("{} {}", escape(field), direction.as_sql()))
            .collect();
        keys.push(format!("{} ASC", escape("createdAt")));
        keys.push("id ASC".to_string());

        let mut sql = format!(
            "SELECT {} FROM type::table($table){} ORDER BY {}",
            self.projection(),
            statement.where_clause(),
            keys.join(", ")
        );
        if let Some((limit, start)) = window {
            sql.push_str(&format!(" LIMIT {limit} START {start}"));
        }

        let rows: Vec<Value> = self.run(sql, statement.params).await?;
        let mut records = rows
            .into_iter()
            .map(|row| self.decode(row))
            .collect::<Result<Vec<_>>>()?;
        for include in includes {
            self.populate(&mut records, include).await?;
        }
        Ok(records)
    }

    fn decode(&self, row: Value) -> Result<AuditRecord> {
        let row = match row {
            Value::Object(map) => Value::Object(strip_nulls(map)),
            other => {
                return Err(Error::Persistence(format!(
                    "unexpected document row shape: {other}"
                )))
            }
        };
        let mut record: AuditRecord = serde_json::from_value(row)?;
        self.schema.retain_declared(&mut record);
        Ok(record)
    }

    /// Attach associated documents by foreign-key lookup.
    async fn populate(&self, records: &mut [AuditRecord], include: &ResolvedInclude) -> Result<()> {
        let association = &include.association;
        let local_field = association.local_field();
        let keys: Vec<Value> = records
            .iter()
            .filter_map(|r| r.field(local_field))
            .filter(|v| !v.is_null())
            .collect();
        if keys.is_empty() {
            for record in records.iter_mut().filter(|_| association.is_many()) {
                record
                    .associations
                    .insert(association.name.clone(), Value::Array(Vec::new()));
            }
            return Ok(());
        }

        let projection = target_projection(&include.attributes);
        let target = Value::String(association.target.clone());
        let grouped: HashMap<String, Vec<Value>> = match &association.link {
            Link::BelongsTo { .. } => {
                let sql = format!(
                    "SELECT record::id(id) AS {KEY_ALIAS}, {projection} FROM type::table($target) \
                     WHERE record::id(id) IN $keys"
                );
                let rows: Vec<Value> = self
                    .run(sql, vec![("target".into(), target), ("keys".into(), Value::Array(keys))])
                    .await?;
                group_by_key(rows)
            }
            Link::HasOne { remote_field, .. } | Link::HasMany { remote_field, .. } => {
                let remote = escape(remote_field);
                let sql = format!(
                    "SELECT {remote} AS {KEY_ALIAS}, {projection} FROM type::table($target) \
                     WHERE {remote} IN $keys ORDER BY {KEY_ALIAS}"
                );
                let rows: Vec<Value> = self
                    .run(sql, vec![("target".into(), target), ("keys".into(), Value::Array(keys))])
                    .await?;
                group_by_key(rows)
            }
            Link::BelongsToMany { join, .. } => {
                let sql = format!(
                    "SELECT {} AS source, {} AS target FROM type::table($join) WHERE {} IN $keys",
                    escape(&join.source_key),
                    escape(&join.target_key),
                    escape(&join.source_key)
                );
                let links: Vec<Value> = self
                    .run(
                        sql,
                        vec![
                            ("join".into(), Value::String(join.table.clone())),
                            ("keys".into(), Value::Array(keys)),
                        ],
                    )
                    .await?;
                let target_ids: Vec<Value> = links.iter().filter_map(|l| l.get("target").cloned()).collect();
                let sql = format!(
                    "SELECT record::id(id) AS {KEY_ALIAS}, {projection} FROM type::table($target) \
                     WHERE record::id(id) IN $ids"
                );
                let targets: Vec<Value> = self
                    .run(
                        sql,
                        vec![("target".into(), target), ("ids".into(), Value::Array(target_ids))],
                    )
                    .await?;
                let by_id = group_by_key(targets);

                let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
                for link in &links {
                    let (Some(source), Some(target)) = (link.get("source"), link.get("target")) else {
                        continue;
                    };
                    if let Some(found) = by_id.get(&key_string(target)) {
                        grouped
                            .entry(key_string(source))
                            .or_default()
                            .extend(found.iter().cloned());
                    }
                }
                grouped
            }
        };

        for record in records.iter_mut() {
            let found = record
                .field(local_field)
                .and_then(|key| grouped.get(&key_string(&key)).cloned())
                .unwrap_or_default();
            if association.is_many() {
                record
                    .associations
                    .insert(association.name.clone(), Value::Array(found));
            } else if let Some(first) = found.into_iter().next() {
                record.associations.insert(association.name.clone(), first);
            }
        }
        Ok(())
    }

    async fn paginate(
        &self,
        query: &QueryDescriptor,
        includes: &[ResolvedInclude],
    ) -> Result<PaginatedResult> {
        query.validate_paging()?;
        self.schema.check_order(&query.order)?;
        let conditions = self.schema.normalize_filter(&query.where_)?;
        self.ensure_collection().await?;

        let total = self.count_where(&conditions, includes).await?;
        let data = self
            .select_records(
                &conditions,
                includes,
                &query.order,
                Some((query.limit, query.offset())),
            )
            .await?;
        Ok(PaginatedResult {
            data,
            total,
            page: query.page,
            limit: query.limit,
        })
    }

    async fn find_by_id(&self, id: &RecordId) -> Result<Option<AuditRecord>> {
        let conditions = vec![("id".to_string(), Value::String(id.to_string()))];
        Ok(self
            .select_records(&conditions, &[], &[], Some((1, 0)))
            .await?
            .into_iter()
            .next())
    }

    fn to_document(record: &AuditRecord) -> Result<Value> {
        let mut stored = record.clone();
        stored.id = None;
        stored.associations.clear();
        match serde_json::to_value(&stored)? {
            Value::Object(map) => Ok(Value::Object(strip_nulls(map))),
            _ => Err(Error::Persistence("record did not serialize to an object".into())),
        }
    }
}

/// Connect a client for `config`, signing in when credentials are given.
pub async fn connect_client(config: &DocumentConfig) -> Result<Surreal<Any>> {
    let db = connect(config.endpoint.as_str())
        .await
        .map_err(|e| Error::Persistence(format!("cannot connect to {}: {e}", config.endpoint)))?;
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        db.signin(Root {
            username: username.as_str(),
            password: password.as_str(),
        })
        .await?;
    }
    db.use_ns(config.namespace.as_str())
        .use_db(config.database.as_str())
        .await?;
    debug!(namespace = %config.namespace, database = %config.database, "document store selected");
    Ok(db)
}

fn escape(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "\\`"))
}

fn target_projection(attributes: &[String]) -> String {
    attributes
        .iter()
        .map(|a| {
            if a == "id" {
                "record::id(id) AS id".to_string()
            } else {
                escape(a)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn membership_predicate(statement: &mut Statement, include: &ResolvedInclude) -> String {
    let association = &include.association;
    let local = DocumentBackend::field_expr(association.local_field());
    let target = statement.bind(Value::String(association.target.clone()));

    match &association.link {
        Link::BelongsTo { .. } => format!(
            "{local} IN (SELECT VALUE record::id(id) FROM type::table({target}))"
        ),
        Link::HasOne { remote_field, .. } | Link::HasMany { remote_field, .. } => format!(
            "{local} IN (SELECT VALUE {} FROM type::table({target}))",
            escape(remote_field)
        ),
        Link::BelongsToMany { join, .. } => {
            let join_table = statement.bind(Value::String(join.table.clone()));
            format!(
                "{local} IN (SELECT VALUE {} FROM type::table({join_table}) WHERE {} IN \
                 (SELECT VALUE record::id(id) FROM type::table({target})))",
                escape(&join.source_key),
                escape(&join.target_key)
            )
        }
    }
}

fn strip_nulls(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter().filter(|(_, v)| !v.is_null()).collect()
}

fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn group_by_key(rows: Vec<Value>) -> HashMap<String, Vec<Value>> {
    let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
    for row in rows {
        let Value::Object(mut map) = row else { continue };
        let Some(key) = map.remove(KEY_ALIAS) else { continue };
        grouped
            .entry(key_string(&key))
            .or_default()
            .push(Value::Object(map));
    }
    grouped
}

fn is_duplicate(err: &surrealdb::Error) -> bool {
    err.to_string().contains("already exists")
}

#[async_trait]
impl AuditStorage for DocumentBackend {
    async fn log_event(&self, mut record: AuditRecord) -> Result<RecordId> {
        self.ensure_collection().await?;
        self.schema.apply_extensions(&mut record);
        let id = record.id.clone().unwrap_or_else(RecordId::generate);
        record.created_at.get_or_insert_with(now);

        if self.find_by_id(&id).await?.is_some() {
            return Err(Error::DuplicateId(id.to_string()));
        }

        let document = Self::to_document(&record)?;
        let result = self
            .db
            .query("CREATE type::thing($table, $id) CONTENT $doc RETURN NONE")
            .bind(("table", self.collection.clone()))
            .bind(("id", id.to_string()))
            .bind(("doc", document))
            .await
            .and_then(|response| response.check());
        match result {
            Ok(_) => {
                debug!(id = %id, collection = %self.collection, "document record written");
                Ok(id)
            }
            Err(e) if is_duplicate(&e) => Err(Error::DuplicateId(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_logs(&self, query: &QueryDescriptor) -> Result<PaginatedResult> {
        self.paginate(&query.without_include_and_order(), &[]).await
    }

    async fn fetch_log(&self, query: &QueryDescriptor) -> Result<Option<AuditRecord>> {
        let conditions = self.schema.normalize_filter(&query.where_)?;
        let includes = self.schema.resolve_includes(&query.include)?;
        self.ensure_collection().await?;
        Ok(self
            .select_records(&conditions, &includes, &[], Some((1, 0)))
            .await?
            .into_iter()
            .next())
    }

    async fn update_log(&self, id: &RecordId, patch: RecordPatch) -> Result<()> {
        self.ensure_collection().await?;
        let Some(mut record) = self.find_by_id(id).await? else {
            debug!(id = %id, "update of missing document record ignored");
            return Ok(());
        };
        patch.apply_to(&mut record);
        self.schema.apply_extensions(&mut record);

        self.db
            .query("UPDATE type::thing($table, $id) CONTENT $doc RETURN NONE")
            .bind(("table", self.collection.clone()))
            .bind(("id", id.to_string()))
            .bind(("doc", Self::to_document(&record)?))
            .await?
            .check()?;
        Ok(())
    }

    async fn delete_log(&self, id: &RecordId) -> Result<()> {
        self.ensure_collection().await?;
        self.db
            .query("DELETE type::thing($table, $id)")
            .bind(("table", self.collection.clone()))
            .bind(("id", id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    async fn delete_logs_older_than(&self, threshold: Option<Timestamp>) -> Result<u64> {
        let threshold = threshold.unwrap_or_else(default_retention_threshold);
        self.ensure_collection().await?;
        let removed: Vec<IgnoredAny> = self
            .run(
                format!(
                    "DELETE type::table($table) WHERE {} < $threshold RETURN BEFORE",
                    escape("createdAt")
                ),
                vec![
                    ("table".into(), Value::String(self.collection.clone())),
                    ("threshold".into(), Value::String(canonical_timestamp(&threshold))),
                ],
            )
            .await?;
        let removed = removed.len() as u64;
        if removed > 0 {
            info!(removed, collection = %self.collection, "pruned document audit records");
        }
        Ok(removed)
    }

    async fn count_logs(&self, filter: &BTreeMap<String, Value>) -> Result<u64> {
        let conditions = self.schema.normalize_filter(filter)?;
        self.ensure_collection().await?;
        self.count_where(&conditions, &[]).await
    }

    async fn find_all(&self, query: &QueryDescriptor) -> Result<PaginatedResult> {
        let includes = self.schema.resolve_includes(&query.include)?;
        self.paginate(query, &includes).await
    }

    async fn fetch_all_logs(&self) -> Result<Vec<AuditRecord>> {
        self.ensure_collection().await?;
        self.select_records(&[], &[], &[], None).await
    }

    fn table_name(&self) -> &str {
        &self.collection
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Document
    }
}
