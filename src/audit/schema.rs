//! Record schema: base fields, extension fields and associations.
//!
//! A `SchemaConfig` is validated once at adapter construction into a
//! `RecordSchema`; every adapter consults the same schema to validate queries
//! and to merge extension fields on write.

use crate::audit::entry::{AuditRecord, LogLevel};
use crate::audit::filter::{Include, SortDirection};
use crate::core::{canonical_timestamp, parse_timestamp, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Base fields every record carries.
pub const BASE_FIELDS: [&str; 7] = [
    "id",
    "userId",
    "action",
    "logLevel",
    "timestamp",
    "createdAt",
    "metadata",
];

/// Names no extension field may take.
const RESERVED_FIELDS: [&str; 1] = ["associations"];

/// Declared type of an extension field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// UTF-8 string
    Text,
    /// 64-bit signed integer
    Integer,
    /// 64-bit float
    Real,
    /// Boolean
    Boolean,
    /// Arbitrary JSON (not filterable)
    Json,
}

impl FieldType {
    /// Whether a JSON value is acceptable for this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::Text => value.is_string(),
            FieldType::Integer => value.is_i64(),
            FieldType::Real => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Json => true,
        }
    }

    /// SQLite column type.
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Text | FieldType::Json => "TEXT",
            FieldType::Integer | FieldType::Boolean => "INTEGER",
            FieldType::Real => "REAL",
        }
    }

    /// SurrealDB field type.
    pub fn document_type(&self) -> &'static str {
        match self {
            FieldType::Text => "string",
            FieldType::Integer => "int",
            FieldType::Real => "float",
            FieldType::Boolean => "bool",
            FieldType::Json => "any",
        }
    }
}

/// Kind of value a field holds, for validation and comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    /// Plain string
    Text,
    /// Log level name
    Level,
    /// Canonical timestamp string
    Timestamp,
    /// Integer
    Integer,
    /// Float
    Real,
    /// Boolean
    Boolean,
    /// Opaque JSON
    Json,
}

impl From<FieldType> for ValueKind {
    fn from(field_type: FieldType) -> Self {
        match field_type {
            FieldType::Text => ValueKind::Text,
            FieldType::Integer => ValueKind::Integer,
            FieldType::Real => ValueKind::Real,
            FieldType::Boolean => ValueKind::Boolean,
            FieldType::Json => ValueKind::Json,
        }
    }
}

/// A deployment-declared extension field and the value stamped on every write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtensionField {
    /// Field name
    pub name: String,
    /// Declared type
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Value merged into every record
    pub value: Value,
}

impl ExtensionField {
    /// Declare an extension field.
    pub fn new(name: &str, field_type: FieldType, value: impl Serialize) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        }
    }
}

/// Relation kind between audit records and a target collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssociationKind {
    /// Record holds the target's id
    BelongsTo,
    /// One target row points back at the record
    HasOne,
    /// Many target rows point back at the record
    HasMany,
    /// Linked through a join table
    BelongsToMany,
}

/// Join table for `belongsToMany`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinTable {
    /// Join table name
    pub table: String,
    /// Column matching the record-side key
    pub source_key: String,
    /// Column holding the target id
    pub target_key: String,
}

/// Association as configured by the deployment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociationConfig {
    /// Relation kind
    pub kind: AssociationKind,
    /// Target table/collection (defaults to the association name)
    #[serde(default)]
    pub target: Option<String>,
    /// `belongsTo`: record field holding the target id.
    /// `hasOne`/`hasMany`: target column pointing at the record.
    #[serde(default)]
    pub foreign_key: Option<String>,
    /// Record-side key for `hasOne`/`hasMany`/`belongsToMany` (defaults to `id`)
    #[serde(default)]
    pub source_key: Option<String>,
    /// Join table, required for `belongsToMany`
    #[serde(default)]
    pub through: Option<JoinTable>,
    /// Target fields returned when an include names no attributes
    #[serde(default)]
    pub fields: Vec<String>,
}

impl AssociationConfig {
    /// `belongsTo` on a record field.
    pub fn belongs_to(foreign_key: &str) -> Self {
        Self {
            kind: AssociationKind::BelongsTo,
            target: None,
            foreign_key: Some(foreign_key.to_string()),
            source_key: None,
            through: None,
            fields: Vec::new(),
        }
    }

    /// `hasOne` via a target column.
    pub fn has_one(foreign_key: &str) -> Self {
        Self {
            kind: AssociationKind::HasOne,
            ..Self::belongs_to(foreign_key)
        }
    }

    /// `hasMany` via a target column.
    pub fn has_many(foreign_key: &str) -> Self {
        Self {
            kind: AssociationKind::HasMany,
            ..Self::belongs_to(foreign_key)
        }
    }

    /// `belongsToMany` through a join table.
    pub fn belongs_to_many(through: Option<JoinTable>) -> Self {
        Self {
            kind: AssociationKind::BelongsToMany,
            target: None,
            foreign_key: None,
            source_key: None,
            through,
            fields: Vec::new(),
        }
    }

    /// Set the target table/collection.
    pub fn with_target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    /// Set the record-side key.
    pub fn with_source_key(mut self, source_key: &str) -> Self {
        self.source_key = Some(source_key.to_string());
        self
    }

    /// Set the default projected target fields.
    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

/// How a validated association links records to the target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Link {
    /// `target.id = record.local_field`
    BelongsTo {
        /// Record field holding the target id
        local_field: String,
    },
    /// `target.remote_field = record.local_field`, first row
    HasOne {
        /// Target column
        remote_field: String,
        /// Record field
        local_field: String,
    },
    /// `target.remote_field = record.local_field`, all rows
    HasMany {
        /// Target column
        remote_field: String,
        /// Record field
        local_field: String,
    },
    /// `join.source_key = record.local_field AND target.id = join.target_key`
    BelongsToMany {
        /// Join table
        join: JoinTable,
        /// Record field
        local_field: String,
    },
}

/// A validated association.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Association {
    /// Association name (as used in `include`)
    pub name: String,
    /// Target table/collection
    pub target: String,
    /// Link description
    pub link: Link,
    /// Default projection (always starts with `id`)
    pub fields: Vec<String>,
}

impl Association {
    /// Whether populated data is an array.
    pub fn is_many(&self) -> bool {
        matches!(self.link, Link::HasMany { .. } | Link::BelongsToMany { .. })
    }

    /// Record-side field the association is keyed on.
    pub fn local_field(&self) -> &str {
        match &self.link {
            Link::BelongsTo { local_field }
            | Link::HasOne { local_field, .. }
            | Link::HasMany { local_field, .. }
            | Link::BelongsToMany { local_field, .. } => local_field,
        }
    }
}

/// Deployment schema configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Extension fields
    #[serde(default)]
    pub extensions: Vec<ExtensionField>,
    /// Associations by name
    #[serde(default)]
    pub associations: BTreeMap<String, AssociationConfig>,
}

impl SchemaConfig {
    /// Empty schema (base fields only).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an extension field.
    pub fn with_extension(mut self, field: ExtensionField) -> Self {
        self.extensions.push(field);
        self
    }

    /// Add an association.
    pub fn with_association(mut self, name: &str, association: AssociationConfig) -> Self {
        self.associations.insert(name.to_string(), association);
        self
    }

    /// Validate into a `RecordSchema`.
    pub fn validate(&self) -> Result<RecordSchema> {
        RecordSchema::new(self)
    }
}

/// One resolved `include` entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedInclude {
    /// Association being included
    pub association: Association,
    /// Drop records without associated data
    pub required: bool,
    /// Projected target fields
    pub attributes: Vec<String>,
}

/// Validated schema shared by all adapters.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordSchema {
    extensions: Vec<ExtensionField>,
    associations: BTreeMap<String, Association>,
}

impl RecordSchema {
    /// Validate a configuration.
    pub fn new(config: &SchemaConfig) -> Result<Self> {
        let mut extensions: Vec<ExtensionField> = Vec::with_capacity(config.extensions.len());
        for field in &config.extensions {
            ensure_identifier("extension field", &field.name)?;
            if BASE_FIELDS.contains(&field.name.as_str())
                || RESERVED_FIELDS.contains(&field.name.as_str())
            {
                return Err(Error::configuration(format!(
                    "extension field '{}' collides with a base field",
                    field.name
                )));
            }
            if extensions.iter().any(|f| f.name == field.name) {
                return Err(Error::configuration(format!(
                    "extension field '{}' declared twice",
                    field.name
                )));
            }
            if field.value.is_null() || !field.field_type.accepts(&field.value) {
                return Err(Error::configuration(format!(
                    "extension field '{}' value {} is not a {:?}",
                    field.name, field.value, field.field_type
                )));
            }
            let mut field = field.clone();
            field.value = normalize_for_kind(field.field_type.into(), field.value);
            extensions.push(field);
        }

        let mut schema = Self {
            extensions,
            associations: BTreeMap::new(),
        };

        for (name, config) in &config.associations {
            let association = schema.resolve_association(name, config)?;
            schema.associations.insert(name.clone(), association);
        }

        Ok(schema)
    }

    fn resolve_association(&self, name: &str, config: &AssociationConfig) -> Result<Association> {
        ensure_identifier("association", name)?;
        if BASE_FIELDS.contains(&name)
            || RESERVED_FIELDS.contains(&name)
            || self.extensions.iter().any(|f| f.name == name)
        {
            return Err(Error::configuration(format!(
                "association '{name}' collides with a record field"
            )));
        }
        let target = config.target.clone().unwrap_or_else(|| name.to_string());
        ensure_identifier("association target", &target)?;
        for field in &config.fields {
            ensure_identifier("association field", field)?;
        }

        let local_key = |key: &Option<String>| -> Result<String> {
            let field = key.clone().unwrap_or_else(|| "id".to_string());
            self.ensure_link_field(name, &field)?;
            Ok(field)
        };
        let foreign_key = || -> Result<String> {
            let key = config.foreign_key.clone().ok_or_else(|| {
                Error::configuration(format!("association '{name}' requires a foreign key"))
            })?;
            ensure_identifier("foreign key", &key)?;
            Ok(key)
        };

        let link = match config.kind {
            AssociationKind::BelongsTo => {
                let local_field = foreign_key()?;
                self.ensure_link_field(name, &local_field)?;
                Link::BelongsTo { local_field }
            }
            AssociationKind::HasOne => Link::HasOne {
                remote_field: foreign_key()?,
                local_field: local_key(&config.source_key)?,
            },
            AssociationKind::HasMany => Link::HasMany {
                remote_field: foreign_key()?,
                local_field: local_key(&config.source_key)?,
            },
            AssociationKind::BelongsToMany => {
                let join = config.through.clone().ok_or_else(|| {
                    Error::configuration(format!(
                        "belongsToMany association '{name}' requires a join table"
                    ))
                })?;
                ensure_identifier("join table", &join.table)?;
                ensure_identifier("join source key", &join.source_key)?;
                ensure_identifier("join target key", &join.target_key)?;
                Link::BelongsToMany {
                    join,
                    local_field: local_key(&config.source_key)?,
                }
            }
        };

        let mut fields = vec!["id".to_string()];
        fields.extend(config.fields.iter().filter(|f| *f != "id").cloned());

        Ok(Association {
            name: name.to_string(),
            target,
            link,
            fields,
        })
    }

    fn ensure_link_field(&self, association: &str, field: &str) -> Result<()> {
        match self.value_kind(field) {
            Some(ValueKind::Json) | None => Err(Error::configuration(format!(
                "association '{association}' links on unknown or non-scalar field '{field}'"
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Kind of a record field, `None` if the field is unknown.
    pub fn value_kind(&self, field: &str) -> Option<ValueKind> {
        match field {
            "id" | "userId" | "action" => Some(ValueKind::Text),
            "logLevel" => Some(ValueKind::Level),
            "timestamp" | "createdAt" => Some(ValueKind::Timestamp),
            "metadata" => Some(ValueKind::Json),
            other => self
                .extensions
                .iter()
                .find(|f| f.name == other)
                .map(|f| f.field_type.into()),
        }
    }

    /// Declared extension fields.
    pub fn extensions(&self) -> &[ExtensionField] {
        &self.extensions
    }

    /// Validated associations.
    pub fn associations(&self) -> &BTreeMap<String, Association> {
        &self.associations
    }

    /// All record columns: base fields then extension fields.
    pub fn columns(&self) -> Vec<String> {
        BASE_FIELDS
            .iter()
            .map(|f| f.to_string())
            .chain(self.extensions.iter().map(|f| f.name.clone()))
            .collect()
    }

    /// Replace the record's extension set with the configured one.
    ///
    /// Caller-supplied values under extension names, and undeclared
    /// attributes, are discarded.
    pub fn apply_extensions(&self, record: &mut AuditRecord) {
        record.extensions = self
            .extensions
            .iter()
            .map(|f| (f.name.clone(), f.value.clone()))
            .collect();
    }

    /// Drop attributes that are not declared extension fields.
    pub fn retain_declared(&self, record: &mut AuditRecord) {
        record
            .extensions
            .retain(|name, _| self.extensions.iter().any(|f| &f.name == name));
    }

    /// Validate a `where` map and bring values into canonical stored form.
    pub fn normalize_filter(&self, filter: &BTreeMap<String, Value>) -> Result<Vec<(String, Value)>> {
        filter
            .iter()
            .map(|(field, value)| {
                let kind = self.filterable_kind(field)?;
                Ok((field.clone(), normalize_query_value(field, kind, value)?))
            })
            .collect()
    }

    /// Validate an `order` list.
    pub fn check_order(&self, order: &[(String, SortDirection)]) -> Result<()> {
        for (field, _) in order {
            self.filterable_kind(field)?;
        }
        Ok(())
    }

    /// Resolve `include` entries against the configured associations.
    pub fn resolve_includes(&self, includes: &[Include]) -> Result<Vec<ResolvedInclude>> {
        includes
            .iter()
            .map(|include| {
                let association = self.associations.get(&include.association).ok_or_else(|| {
                    Error::invalid_query(format!("unknown association '{}'", include.association))
                })?;
                let attributes = match &include.attributes {
                    Some(attributes) => {
                        for attribute in attributes {
                            if !association.fields.contains(attribute) {
                                return Err(Error::invalid_query(format!(
                                    "association '{}' has no field '{}'",
                                    association.name, attribute
                                )));
                            }
                        }
                        attributes.clone()
                    }
                    None => association.fields.clone(),
                };
                Ok(ResolvedInclude {
                    association: association.clone(),
                    required: include.required,
                    attributes,
                })
            })
            .collect()
    }

    /// Canonical form of a stored value, for in-process comparison.
    ///
    /// Lenient: values that cannot be converted are returned unchanged.
    pub fn normalize_stored(&self, field: &str, value: &Value) -> Value {
        match self.value_kind(field) {
            Some(ValueKind::Timestamp) => value
                .as_str()
                .and_then(parse_timestamp)
                .map(|ts| Value::String(canonical_timestamp(&ts)))
                .unwrap_or_else(|| value.clone()),
            Some(kind) => normalize_for_kind(kind, value.clone()),
            None => value.clone(),
        }
    }

    fn filterable_kind(&self, field: &str) -> Result<ValueKind> {
        match self.value_kind(field) {
            Some(ValueKind::Json) => Err(Error::invalid_query(format!(
                "field '{field}' holds opaque JSON and cannot be filtered or ordered"
            ))),
            Some(kind) => Ok(kind),
            None => Err(Error::invalid_query(format!("unknown field '{field}'"))),
        }
    }
}

fn normalize_for_kind(kind: ValueKind, value: Value) -> Value {
    match (kind, &value) {
        (ValueKind::Real, Value::Number(n)) => n
            .as_f64()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(value),
        _ => value,
    }
}

fn normalize_query_value(field: &str, kind: ValueKind, value: &Value) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let mismatch = || Error::invalid_query(format!("value {value} does not fit field '{field}'"));
    match kind {
        ValueKind::Text => value.is_string().then(|| value.clone()).ok_or_else(mismatch),
        ValueKind::Level => {
            let name = value.as_str().ok_or_else(mismatch)?;
            let level: LogLevel = name.parse().map_err(|_| mismatch())?;
            Ok(Value::String(level.as_str().to_string()))
        }
        ValueKind::Timestamp => value
            .as_str()
            .and_then(parse_timestamp)
            .map(|ts| Value::String(canonical_timestamp(&ts)))
            .ok_or_else(mismatch),
        ValueKind::Integer => value.is_i64().then(|| value.clone()).ok_or_else(mismatch),
        ValueKind::Real => value
            .is_number()
            .then(|| normalize_for_kind(ValueKind::Real, value.clone()))
            .ok_or_else(mismatch),
        ValueKind::Boolean => value.is_boolean().then(|| value.clone()).ok_or_else(mismatch),
        ValueKind::Json => Err(mismatch()),
    }
}

/// Whether `name` is a safe identifier (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Fail with a configuration error unless `name` is a safe identifier.
pub fn ensure_identifier(what: &str, name: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(Error::configuration(format!("invalid {what} name '{name}'")))
    }
}

/// Adapter-owned registry of defined schema handles, keyed by collection name.
///
/// A handle is defined once, on first request, and reused afterwards.
pub struct SchemaRegistry<H> {
    handles: Mutex<HashMap<String, Arc<H>>>,
}

impl<H> SchemaRegistry<H> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Return the handle for `name`, defining it with `define` on first use.
    pub async fn get_or_define<F, Fut>(&self, name: &str, define: F) -> Result<Arc<H>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<H>>,
    {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(name) {
            return Ok(handle.clone());
        }
        let handle = Arc::new(define().await?);
        handles.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Return an already-defined handle.
    pub async fn get(&self, name: &str) -> Option<Arc<H>> {
        self.handles.lock().await.get(name).cloned()
    }

    /// Number of defined handles.
    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Whether nothing has been defined yet.
    pub async fn is_empty(&self) -> bool {
        self.handles.lock().await.is_empty()
    }
}

impl<H> Default for SchemaRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
