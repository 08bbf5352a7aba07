//! Audit record structure.
//!
//! Backend-agnostic audit event shape.

use crate::core::{canonical_timestamp, canonical_ts, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Unique record identifier, unique only within its origin backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    /// Create a record ID from a string.
    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }

    /// Generate a UUID-like ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the ID string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Audit event severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Informational
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
    /// Debug
    Debug,
    /// Deployment-defined
    Custom,
}

impl LogLevel {
    /// All levels, in declaration order.
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Debug,
        LogLevel::Custom,
    ];

    /// Persisted name of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Debug => "DEBUG",
            LogLevel::Custom => "CUSTOM",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = crate::core::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| crate::core::Error::Persistence(format!("unknown log level: {s}")))
    }
}

/// An audit record.
///
/// Serialized with camelCase keys; extension fields are flattened into the
/// top-level object so a stored record is self-describing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Backend-assigned ID (optional on input)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    /// Acting user
    pub user_id: String,
    /// Event name
    pub action: String,
    /// Severity
    pub log_level: LogLevel,
    /// Caller-supplied event time
    #[serde(default, with = "canonical_ts", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// Creation instant, used by retention pruning
    #[serde(default, with = "canonical_ts", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
    /// Opaque structured payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Associated data populated by `include`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub associations: BTreeMap<String, Value>,
    /// Deployment extension fields
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl AuditRecord {
    /// Create a new record without an ID.
    pub fn new(user_id: &str, action: &str, log_level: LogLevel) -> Self {
        Self {
            id: None,
            user_id: user_id.to_string(),
            action: action.to_string(),
            log_level,
            timestamp: None,
            created_at: None,
            metadata: None,
            associations: BTreeMap::new(),
            extensions: BTreeMap::new(),
        }
    }

    /// Set an explicit ID.
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(RecordId::new(id));
        self
    }

    /// Set the event time.
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Backfill the creation instant.
    pub fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Replace the metadata payload.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Add one key to an object metadata payload.
    pub fn with_metadata_field(mut self, key: &str, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            match self.metadata.get_or_insert_with(|| Value::Object(Default::default())) {
                Value::Object(map) => {
                    map.insert(key.to_string(), v);
                }
                other => {
                    let mut map = serde_json::Map::new();
                    map.insert(key.to_string(), v);
                    *other = Value::Object(map);
                }
            }
        }
        self
    }

    /// Set an extension field value (overridden on write by the backend's set).
    pub fn with_extension(mut self, name: &str, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.extensions.insert(name.to_string(), v);
        }
        self
    }

    /// Value of a base or extension field as stored.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => self.id.as_ref().map(|id| Value::String(id.0.clone())),
            "userId" => Some(Value::String(self.user_id.clone())),
            "action" => Some(Value::String(self.action.clone())),
            "logLevel" => Some(Value::String(self.log_level.as_str().to_string())),
            "timestamp" => self
                .timestamp
                .as_ref()
                .map(|ts| Value::String(canonical_timestamp(ts))),
            "createdAt" => self
                .created_at
                .as_ref()
                .map(|ts| Value::String(canonical_timestamp(ts))),
            "metadata" => self.metadata.clone(),
            other => self.extensions.get(other).cloned(),
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> crate::core::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> crate::core::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Partial fields for `update_log`.
///
/// ID and creation instant are not updatable.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    /// New user
    pub user_id: Option<String>,
    /// New action
    pub action: Option<String>,
    /// New severity
    pub log_level: Option<LogLevel>,
    /// New event time
    #[serde(default, with = "canonical_ts")]
    pub timestamp: Option<Timestamp>,
    /// New metadata (`Value::Null` clears it)
    pub metadata: Option<Value>,
}

impl RecordPatch {
    /// Create an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Change the user.
    pub fn user_id(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    /// Change the action.
    pub fn action(mut self, action: &str) -> Self {
        self.action = Some(action.to_string());
        self
    }

    /// Change the severity.
    pub fn log_level(mut self, log_level: LogLevel) -> Self {
        self.log_level = Some(log_level);
        self
    }

    /// Change the event time.
    pub fn timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Change the metadata.
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Apply this patch onto a record in place.
    pub fn apply_to(&self, record: &mut AuditRecord) {
        if let Some(user_id) = &self.user_id {
            record.user_id = user_id.clone();
        }
        if let Some(action) = &self.action {
            record.action = action.clone();
        }
        if let Some(level) = self.log_level {
            record.log_level = level;
        }
        if let Some(ts) = self.timestamp {
            record.timestamp = Some(ts);
        }
        if let Some(metadata) = &self.metadata {
            record.metadata = match metadata {
                Value::Null => None,
                other => Some(other.clone()),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id() {
        let id = RecordId::new("test-id");
        assert_eq!(id.as_str(), "test-id");
        assert_eq!(id.to_string(), "test-id");
        assert_ne!(RecordId::generate(), RecordId::generate());
    }

    #[test]
    fn test_log_level_names() {
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
        assert_eq!("CUSTOM".parse::<LogLevel>().unwrap(), LogLevel::Custom);
        assert!("warning".parse::<LogLevel>().is_err());
        assert_eq!(serde_json::to_value(LogLevel::Debug).unwrap(), json!("DEBUG"));
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = AuditRecord::new("u1", "LOGIN", LogLevel::Info)
            .with_id("1")
            .with_metadata_field("ip", "127.0.0.1")
            .with_extension("region", "eu");

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["logLevel"], "INFO");
        assert_eq!(value["metadata"]["ip"], "127.0.0.1");
        assert_eq!(value["region"], "eu");
        assert!(value.get("timestamp").is_none());
    }

    #[test]
    fn test_record_json_roundtrip_keeps_extensions() {
        let record = AuditRecord::new("u1", "LOGIN", LogLevel::Error)
            .with_timestamp(crate::core::now())
            .with_extension("tenant", 7);
        let parsed = AuditRecord::from_json(&record.to_json().unwrap()).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_field_lookup() {
        let record = AuditRecord::new("u1", "LOGIN", LogLevel::Warn)
            .with_id("r1")
            .with_extension("region", "eu");
        assert_eq!(record.field("id"), Some(json!("r1")));
        assert_eq!(record.field("logLevel"), Some(json!("WARN")));
        assert_eq!(record.field("region"), Some(json!("eu")));
        assert_eq!(record.field("timestamp"), None);
    }

    #[test]
    fn test_patch_apply() {
        let mut record = AuditRecord::new("u1", "LOGIN", LogLevel::Info)
            .with_metadata(json!({"a": 1}));
        RecordPatch::new()
            .action("LOGOUT")
            .log_level(LogLevel::Warn)
            .metadata(Value::Null)
            .apply_to(&mut record);

        assert_eq!(record.user_id, "u1");
        assert_eq!(record.action, "LOGOUT");
        assert_eq!(record.log_level, LogLevel::Warn);
        assert!(record.metadata.is_none());
    }
}
