//! Relational backend implementation.
//!
//! One SQL table per record type (SQLite through sqlx). Associations are
//! resolved with correlated JSON sub-selects inside a single fetch query.

use crate::audit::backend::{AuditStorage, BackendType};
use crate::audit::config::RelationalConfig;
use crate::audit::entry::{AuditRecord, LogLevel, RecordId, RecordPatch};
use crate::audit::filter::{PaginatedResult, QueryDescriptor, SortDirection};
use crate::audit::schema::{
    ensure_identifier, FieldType, Link, RecordSchema, ResolvedInclude, SchemaConfig,
    SchemaRegistry,
};
use crate::core::{
    canonical_timestamp, default_retention_threshold, now, parse_timestamp, Error, Result,
    Timestamp,
};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Alias of the audit table inside generated statements.
const ALIAS: &str = "a";

/// DDL for one audit table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableDefinition {
    /// Table name
    pub table: String,
    /// `CREATE TABLE IF NOT EXISTS ...`
    pub create_table: String,
    /// `CREATE INDEX IF NOT EXISTS ...` on the creation instant
    pub create_index: String,
}

impl TableDefinition {
    fn new(table: &str, schema: &RecordSchema) -> Self {
        let mut columns = vec![
            format!("{} TEXT PRIMARY KEY NOT NULL", quote("id")),
            format!("{} TEXT NOT NULL", quote("userId")),
            format!("{} TEXT NOT NULL", quote("action")),
            format!("{} TEXT NOT NULL", quote("logLevel")),
            format!("{} TEXT", quote("timestamp")),
            format!("{} TEXT NOT NULL", quote("createdAt")),
            format!("{} TEXT", quote("metadata")),
        ];
        columns.extend(
            schema
                .extensions()
                .iter()
                .map(|f| format!("{} {}", quote(&f.name), f.field_type.sql_type())),
        );

        Self {
            table: table.to_string(),
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                quote(table),
                columns.join(", ")
            ),
            create_index: format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote(&format!("idx_{table}_createdAt")),
                quote(table),
                quote("createdAt")
            ),
        }
    }
}

/// A value bound into a statement.
#[derive(Clone, Debug, PartialEq)]
enum Bound {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
}

impl Bound {
    fn from_json(field_type: FieldType, value: &Value) -> Bound {
        match (field_type, value) {
            (_, Value::Null) => Bound::Null,
            (FieldType::Json, v) => Bound::Text(v.to_string()),
            (_, Value::String(s)) => Bound::Text(s.clone()),
            (_, Value::Bool(b)) => Bound::Boolean(*b),
            (FieldType::Real, Value::Number(n)) => Bound::Real(n.as_f64().unwrap_or_default()),
            (_, Value::Number(n)) => match n.as_i64() {
                Some(i) => Bound::Integer(i),
                None => Bound::Real(n.as_f64().unwrap_or_default()),
            },
            (_, other) => Bound::Text(other.to_string()),
        }
    }

    fn text(value: Option<String>) -> Bound {
        value.map_or(Bound::Null, Bound::Text)
    }

    fn push(self, qb: &mut QueryBuilder<'_, Sqlite>) {
        match self {
            Bound::Null => qb.push_bind(None::<String>),
            Bound::Text(s) => qb.push_bind(s),
            Bound::Integer(i) => qb.push_bind(i),
            Bound::Real(f) => qb.push_bind(f),
            Bound::Boolean(b) => qb.push_bind(b),
        };
    }
}

/// Relational backend over a SQLite pool.
pub struct SqlBackend {
    pool: SqlitePool,
    table: String,
    schema: RecordSchema,
    registry: SchemaRegistry<TableDefinition>,
}

impl SqlBackend {
    /// Connect a pool and create the backend.
    pub async fn new(config: &RelationalConfig, schema: &SchemaConfig) -> Result<Self> {
        let backend = Self::with_pool(connect(config).await?, &config.table, schema)?;
        info!(url = %config.url, table = %config.table, "relational audit backend ready");
        Ok(backend)
    }

    /// Create a backend on an existing (possibly shared) pool.
    pub fn with_pool(pool: SqlitePool, table: &str, schema: &SchemaConfig) -> Result<Self> {
        ensure_identifier("table", table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            schema: schema.validate()?,
            registry: SchemaRegistry::new(),
        })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the table and its index if missing. Idempotent.
    pub async fn sync_table(&self) -> Result<()> {
        let definition = TableDefinition::new(&self.table, &self.schema);
        self.execute_definition(&definition).await
    }

    async fn execute_definition(&self, definition: &TableDefinition) -> Result<()> {
        sqlx::query(&definition.create_table)
            .execute(&self.pool)
            .await?;
        sqlx::query(&definition.create_index)
            .execute(&self.pool)
            .await?;
        debug!(table = %definition.table, "audit table synced");
        Ok(())
    }

    async fn ensure_table(&self) -> Result<()> {
        self.registry
            .get_or_define(&self.table, || async {
                let definition = TableDefinition::new(&self.table, &self.schema);
                self.execute_definition(&definition).await?;
                Ok(definition)
            })
            .await
            .map(|_| ())
    }

    fn column(field: &str) -> String {
        format!("{ALIAS}.{}", quote(field))
    }

    fn push_where(
        &self,
        qb: &mut QueryBuilder<'_, Sqlite>,
        conditions: &[(String, Value)],
        includes: &[ResolvedInclude],
    ) {
        let mut first = true;
        for (field, value) in conditions {
            push_conjunction(qb, &mut first);
            qb.push(Self::column(field));
            if value.is_null() {
                qb.push(" IS NULL");
            } else {
                qb.push(" = ");
                Bound::from_json(self.field_type(field), value).push(qb);
            }
        }
        for include in includes.iter().filter(|i| i.required) {
            push_conjunction(qb, &mut first);
            qb.push(exists_predicate(include));
        }
    }

    fn field_type(&self, field: &str) -> FieldType {
        self.schema
            .extensions()
            .iter()
            .find(|f| f.name == field)
            .map_or(FieldType::Text, |f| f.field_type)
    }

    fn select_list(&self, includes: &[ResolvedInclude]) -> String {
        let mut columns: Vec<String> = self
            .schema
            .columns()
            .iter()
            .map(|c| Self::column(c))
            .collect();
        columns.extend(includes.iter().map(|include| {
            format!(
                "{} AS {}",
                population_subquery(include),
                quote(&include_alias(include))
            )
        }));
        columns.join(", ")
    }

    fn push_order(qb: &mut QueryBuilder<'_, Sqlite>, order: &[(String, SortDirection)]) {
        let mut keys: Vec<String> = order
            .iter()
            .map(|(field, direction)| format!("{} {}", Self::column(field), direction.as_sql()))
            .collect();
        keys.push(format!("{} ASC", Self::column("createdAt")));
        keys.push(format!("{ALIAS}.rowid ASC"));
        qb.push(" ORDER BY ").push(keys.join(", "));
    }

    async fn count_where(
        &self,
        conditions: &[(String, Value)],
        includes: &[ResolvedInclude],
    ) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM ");
        qb.push(quote(&self.table)).push(" AS ").push(ALIAS);
        self.push_where(&mut qb, conditions, includes);
        let total: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(total.max(0) as u64)
    }

    async fn select_rows(
        &self,
        conditions: &[(String, Value)],
        includes: &[ResolvedInclude],
        order: &[(String, SortDirection)],
        window: Option<(u64, u64)>,
    ) -> Result<Vec<AuditRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
        qb.push(self.select_list(includes))
            .push(" FROM ")
            .push(quote(&self.table))
            .push(" AS ")
            .push(ALIAS);
        self.push_where(&mut qb, conditions, includes);
        Self::push_order(&mut qb, order);
        if let Some((limit, offset)) = window {
            qb.push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX))
                .push(" OFFSET ")
                .push_bind(i64::try_from(offset).unwrap_or(i64::MAX));
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| self.decode_row(row, includes))
            .collect()
    }

    async fn paginate(
        &self,
        query: &QueryDescriptor,
        includes: &[ResolvedInclude],
    ) -> Result<PaginatedResult> {
        query.validate_paging()?;
        self.schema.check_order(&query.order)?;
        let conditions = self.schema.normalize_filter(&query.where_)?;
        self.ensure_table().await?;

        let total = self.count_where(&conditions, includes).await?;
        let data = self
            .select_rows(
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

    fn decode_row(&self, row: &SqliteRow, includes: &[ResolvedInclude]) -> Result<AuditRecord> {
        let level: String = row.try_get("logLevel")?;
        let mut record = AuditRecord::new(
            &row.try_get::<String, _>("userId")?,
            &row.try_get::<String, _>("action")?,
            level.parse::<LogLevel>()?,
        );
        record.id = Some(RecordId(row.try_get("id")?));
        record.timestamp = decode_timestamp(row.try_get("timestamp")?)?;
        record.created_at = decode_timestamp(row.try_get("createdAt")?)?;
        record.metadata = row
            .try_get::<Option<String>, _>("metadata")?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?;

        for field in self.schema.extensions() {
            let name = field.name.as_str();
            let value = match field.field_type {
                FieldType::Text => row.try_get::<Option<String>, _>(name)?.map(Value::String),
                FieldType::Integer => row.try_get::<Option<i64>, _>(name)?.map(Value::from),
                FieldType::Real => row
                    .try_get::<Option<f64>, _>(name)?
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number),
                FieldType::Boolean => row.try_get::<Option<bool>, _>(name)?.map(Value::Bool),
                FieldType::Json => row
                    .try_get::<Option<String>, _>(name)?
                    .map(|raw| serde_json::from_str(&raw))
                    .transpose()?,
            };
            if let Some(value) = value {
                record.extensions.insert(field.name.clone(), value);
            }
        }

        for include in includes {
            let raw: Option<String> = row.try_get(include_alias(include).as_str())?;
            if let Some(raw) = raw {
                record
                    .associations
                    .insert(include.association.name.clone(), serde_json::from_str(&raw)?);
            }
        }
        Ok(record)
    }

    fn write_values(&self, record: &AuditRecord) -> Result<Vec<(String, Bound)>> {
        let created_at = record
            .created_at
            .as_ref()
            .map(canonical_timestamp)
            .ok_or_else(|| Error::Persistence("record has no creation instant".into()))?;
        let mut values = vec![
            ("userId".to_string(), Bound::Text(record.user_id.clone())),
            ("action".to_string(), Bound::Text(record.action.clone())),
            (
                "logLevel".to_string(),
                Bound::Text(record.log_level.as_str().to_string()),
            ),
            (
                "timestamp".to_string(),
                Bound::text(record.timestamp.as_ref().map(canonical_timestamp)),
            ),
            ("createdAt".to_string(), Bound::Text(created_at)),
            (
                "metadata".to_string(),
                Bound::text(record.metadata.as_ref().map(Value::to_string)),
            ),
        ];
        for field in self.schema.extensions() {
            let value = record.extensions.get(&field.name).unwrap_or(&Value::Null);
            values.push((field.name.clone(), Bound::from_json(field.field_type, value)));
        }
        Ok(values)
    }

    async fn find_by_id(&self, id: &RecordId) -> Result<Option<AuditRecord>> {
        let conditions = vec![("id".to_string(), Value::String(id.to_string()))];
        Ok(self
            .select_rows(&conditions, &[], &[], Some((1, 0)))
            .await?
            .into_iter()
            .next())
    }
}

/// Open a SQLite pool for `config`.
///
/// In-memory databases are private to a connection, so they get a single
/// connection that is never recycled.
pub async fn connect(config: &RelationalConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| Error::configuration(format!("invalid database url {}: {e}", config.url)))?
        .create_if_missing(true);
    let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");

    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
    } else {
        SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
    };
    Ok(pool.connect_with(options).await?)
}

fn push_conjunction(qb: &mut QueryBuilder<'_, Sqlite>, first: &mut bool) {
    qb.push(if *first { " WHERE " } else { " AND " });
    *first = false;
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn include_alias(include: &ResolvedInclude) -> String {
    format!("include_{}", include.association.name)
}

fn local_column(include: &ResolvedInclude) -> String {
    format!("{ALIAS}.{}", quote(include.association.local_field()))
}

fn json_projection(attributes: &[String]) -> String {
    let pairs: Vec<String> = attributes
        .iter()
        .map(|a| format!("'{a}', t.{}", quote(a)))
        .collect();
    format!("json_object({})", pairs.join(", "))
}

/// Correlated sub-select producing the association as JSON text.
fn population_subquery(include: &ResolvedInclude) -> String {
    let association = &include.association;
    let target = quote(&association.target);
    let local = local_column(include);
    let object = json_projection(&include.attributes);

    match &association.link {
        Link::BelongsTo { .. } => format!(
            "(SELECT {object} FROM {target} AS t WHERE t.{} = {local} LIMIT 1)",
            quote("id")
        ),
        Link::HasOne { remote_field, .. } => format!(
            "(SELECT {object} FROM {target} AS t WHERE t.{} = {local} LIMIT 1)",
            quote(remote_field)
        ),
        Link::HasMany { remote_field, .. } => format!(
            "(SELECT json_group_array({object}) FROM {target} AS t WHERE t.{} = {local})",
            quote(remote_field)
        ),
        Link::BelongsToMany { join, .. } => format!(
            "(SELECT json_group_array({object}) FROM {target} AS t \
             JOIN {} AS j ON t.{} = j.{} WHERE j.{} = {local})",
            quote(&join.table),
            quote("id"),
            quote(&join.target_key),
            quote(&join.source_key)
        ),
    }
}

/// `EXISTS` predicate for a required include.
fn exists_predicate(include: &ResolvedInclude) -> String {
    let association = &include.association;
    let target = quote(&association.target);
    let local = local_column(include);

    match &association.link {
        Link::BelongsTo { .. } => format!(
            "EXISTS (SELECT 1 FROM {target} AS t WHERE t.{} = {local})",
            quote("id")
        ),
        Link::HasOne { remote_field, .. } | Link::HasMany { remote_field, .. } => format!(
            "EXISTS (SELECT 1 FROM {target} AS t WHERE t.{} = {local})",
            quote(remote_field)
        ),
        Link::BelongsToMany { join, .. } => format!(
            "EXISTS (SELECT 1 FROM {} AS j JOIN {target} AS t ON t.{} = j.{} WHERE j.{} = {local})",
            quote(&join.table),
            quote("id"),
            quote(&join.target_key),
            quote(&join.source_key)
        ),
    }
}

fn decode_timestamp(raw: Option<String>) -> Result<Option<Timestamp>> {
    raw.map(|s| {
        parse_timestamp(&s).ok_or_else(|| Error::Persistence(format!("stored timestamp '{s}' is invalid")))
    })
    .transpose()
}

fn map_insert_error(err: sqlx::Error, id: &RecordId) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => Error::DuplicateId(id.to_string()),
        _ => err.into(),
    }
}

#[async_trait]
impl AuditStorage for SqlBackend {
    async fn log_event(&self, mut record: AuditRecord) -> Result<RecordId> {
        self.ensure_table().await?;
        self.schema.apply_extensions(&mut record);
        let id = record.id.clone().unwrap_or_else(RecordId::generate);
        record.created_at.get_or_insert_with(now);

        let values = self.write_values(&record)?;
        let mut qb = QueryBuilder::<Sqlite>::new("INSERT INTO ");
        qb.push(quote(&self.table)).push(" (").push(quote("id"));
        for (column, _) in &values {
            qb.push(", ").push(quote(column));
        }
        qb.push(") VALUES (");
        qb.push_bind(id.to_string());
        for (_, value) in values {
            qb.push(", ");
            value.push(&mut qb);
        }
        qb.push(")");

        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|e| map_insert_error(e, &id))?;
        debug!(id = %id, table = %self.table, "relational record written");
        Ok(id)
    }

    async fn fetch_logs(&self, query: &QueryDescriptor) -> Result<PaginatedResult> {
        self.paginate(&query.without_include_and_order(), &[]).await
    }

    async fn fetch_log(&self, query: &QueryDescriptor) -> Result<Option<AuditRecord>> {
        let conditions = self.schema.normalize_filter(&query.where_)?;
        let includes = self.schema.resolve_includes(&query.include)?;
        self.ensure_table().await?;
        Ok(self
            .select_rows(&conditions, &includes, &[], Some((1, 0)))
            .await?
            .into_iter()
            .next())
    }

    async fn update_log(&self, id: &RecordId, patch: RecordPatch) -> Result<()> {
        self.ensure_table().await?;
        let Some(mut record) = self.find_by_id(id).await? else {
            debug!(id = %id, "update of missing relational record ignored");
            return Ok(());
        };
        patch.apply_to(&mut record);
        self.schema.apply_extensions(&mut record);

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE ");
        qb.push(quote(&self.table)).push(" SET ");
        let values: Vec<(String, Bound)> = self
            .write_values(&record)?
            .into_iter()
            .filter(|(column, _)| column != "createdAt")
            .collect();
        for (index, (column, value)) in values.into_iter().enumerate() {
            if index > 0 {
                qb.push(", ");
            }
            qb.push(quote(&column)).push(" = ");
            value.push(&mut qb);
        }
        qb.push(" WHERE ")
            .push(quote("id"))
            .push(" = ")
            .push_bind(id.to_string());
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_log(&self, id: &RecordId) -> Result<()> {
        self.ensure_table().await?;
        let sql = format!("DELETE FROM {} WHERE {} = ?", quote(&self.table), quote("id"));
        sqlx::query(&sql)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_logs_older_than(&self, threshold: Option<Timestamp>) -> Result<u64> {
        let threshold = threshold.unwrap_or_else(default_retention_threshold);
        self.ensure_table().await?;
        let sql = format!(
            "DELETE FROM {} WHERE {} < ?",
            quote(&self.table),
            quote("createdAt")
        );
        let removed = sqlx::query(&sql)
            .bind(canonical_timestamp(&threshold))
            .execute(&self.pool)
            .await?
            .rows_affected();
        if removed > 0 {
            info!(removed, table = %self.table, "pruned relational audit records");
        }
        Ok(removed)
    }

    async fn count_logs(&self, filter: &BTreeMap<String, Value>) -> Result<u64> {
        let conditions = self.schema.normalize_filter(filter)?;
        self.ensure_table().await?;
        self.count_where(&conditions, &[]).await
    }

    async fn find_all(&self, query: &QueryDescriptor) -> Result<PaginatedResult> {
        let includes = self.schema.resolve_includes(&query.include)?;
        self.paginate(query, &includes).await
    }

    async fn fetch_all_logs(&self) -> Result<Vec<AuditRecord>> {
        self.ensure_table().await?;
        self.select_rows(&[], &[], &[], None).await
    }

    fn table_name(&self) -> &str {
        &self.table
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Relational
    }
}
