//! Audit storage configuration.
//!
//! Configuration-driven backend selection.

use crate::audit::backend::BackendType;
use crate::audit::schema::SchemaConfig;
use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Audit storage configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend type to use
    pub backend: BackendType,
    /// File-specific config
    #[serde(default)]
    pub file: Option<FileConfig>,
    /// Relational-specific config
    #[serde(default)]
    pub relational: Option<RelationalConfig>,
    /// Document-specific config
    #[serde(default)]
    pub document: Option<DocumentConfig>,
    /// Extension fields and associations
    #[serde(default)]
    pub schema: SchemaConfig,
}

impl StorageConfig {
    /// File backend at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendType::File,
            file: Some(FileConfig { path: path.into() }),
            relational: None,
            document: None,
            schema: SchemaConfig::default(),
        }
    }

    /// Relational backend at `url`.
    pub fn relational(url: &str) -> Self {
        Self {
            backend: BackendType::Relational,
            file: None,
            relational: Some(RelationalConfig {
                url: url.to_string(),
                ..Default::default()
            }),
            document: None,
            schema: SchemaConfig::default(),
        }
    }

    /// Document backend at `endpoint`.
    pub fn document(endpoint: &str) -> Self {
        Self {
            backend: BackendType::Document,
            file: None,
            relational: None,
            document: Some(DocumentConfig {
                endpoint: endpoint.to_string(),
                ..Default::default()
            }),
            schema: SchemaConfig::default(),
        }
    }

    /// Attach a schema.
    pub fn with_schema(mut self, schema: SchemaConfig) -> Self {
        self.schema = schema;
        self
    }

    /// Parse from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::configuration(format!("invalid storage config: {e}")))
    }

    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::file(FileConfig::default().path)
    }
}

/// File backend configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    /// Path of the JSON array file
    pub path: PathBuf,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("audit_logs.json"),
        }
    }
}

/// Relational backend configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationalConfig {
    /// Connection URL
    pub url: String,
    /// Table name
    pub table: String,
    /// Max connections
    pub max_connections: u32,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            table: "audit_logs".to_string(),
            max_connections: 5,
        }
    }
}

/// Document backend configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// `mem://` or `ws://host:port`
    pub endpoint: String,
    /// Namespace
    pub namespace: String,
    /// Database
    pub database: String,
    /// Collection name
    pub collection: String,
    /// Root username (remote only)
    pub username: Option<String>,
    /// Root password (remote only)
    pub password: Option<String>,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "audit".to_string(),
            database: "audit".to_string(),
            collection: "audit_logs".to_string(),
            username: None,
            password: None,
        }
    }
}
