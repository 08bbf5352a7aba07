//! Query descriptors for audit records.
//!
//! One descriptor shape is understood by every backend.

use crate::audit::entry::AuditRecord;
use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Default page number.
pub const DEFAULT_PAGE: u64 = 1;

/// Default page size.
pub const DEFAULT_LIMIT: u64 = 10;

/// Sort direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

impl SortDirection {
    /// SQL keyword.
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }

    /// Orient an ascending comparison.
    pub fn apply(&self, ordering: Ordering) -> Ordering {
        match self {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    }
}

/// Request to populate associated data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Include {
    /// Association name
    pub association: String,
    /// Drop records without associated data
    #[serde(default)]
    pub required: bool,
    /// Target fields to project
    #[serde(default)]
    pub attributes: Option<Vec<String>>,
}

impl Include {
    /// Include an association.
    pub fn new(association: &str) -> Self {
        Self {
            association: association.to_string(),
            required: false,
            attributes: None,
        }
    }

    /// Only keep records that have associated data.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Project specific target fields.
    pub fn attributes(mut self, attributes: &[&str]) -> Self {
        self.attributes = Some(attributes.iter().map(|a| a.to_string()).collect());
        self
    }
}

fn default_page() -> u64 {
    DEFAULT_PAGE
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

/// Query over audit records.
///
/// `where` holds exact-match conditions combined with AND; a `null` value
/// matches records where the field is absent or null.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    /// Exact-match conditions
    #[serde(rename = "where", default)]
    pub where_: BTreeMap<String, Value>,
    /// Associations to populate
    #[serde(default)]
    pub include: Vec<Include>,
    /// Sort keys, applied in order
    #[serde(default)]
    pub order: Vec<(String, SortDirection)>,
    /// 1-based page number
    #[serde(default = "default_page")]
    pub page: u64,
    /// Page size
    #[serde(default = "default_limit")]
    pub limit: u64,
}

impl Default for QueryDescriptor {
    fn default() -> Self {
        Self {
            where_: BTreeMap::new(),
            include: Vec::new(),
            order: Vec::new(),
            page: DEFAULT_PAGE,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl QueryDescriptor {
    /// Create an empty query (first page of ten).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an exact-match condition.
    pub fn filter(mut self, field: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.where_.insert(field.to_string(), value);
        self
    }

    /// Populate an association.
    pub fn include(mut self, include: Include) -> Self {
        self.include.push(include);
        self
    }

    /// Add a sort key.
    pub fn order_by(mut self, field: &str, direction: SortDirection) -> Self {
        self.order.push((field.to_string(), direction));
        self
    }

    /// Set the page number.
    pub fn page(mut self, page: u64) -> Self {
        self.page = page;
        self
    }

    /// Set the page size.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Copy without include or order, as used by `fetch_logs`.
    pub fn without_include_and_order(&self) -> Self {
        Self {
            where_: self.where_.clone(),
            include: Vec::new(),
            order: Vec::new(),
            page: self.page,
            limit: self.limit,
        }
    }

    /// Reject zero page or limit.
    pub fn validate_paging(&self) -> Result<()> {
        if self.page == 0 {
            return Err(Error::invalid_query("page must be at least 1"));
        }
        if self.limit == 0 {
            return Err(Error::invalid_query("limit must be at least 1"));
        }
        Ok(())
    }

    /// Number of records to skip.
    pub fn offset(&self) -> u64 {
        self.page.saturating_sub(1).saturating_mul(self.limit)
    }
}

/// One page of results plus the total match count.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaginatedResult {
    /// Records on this page
    pub data: Vec<AuditRecord>,
    /// Records matching `where`, ignoring pagination
    pub total: u64,
    /// Page number echoed from the query
    pub page: u64,
    /// Page size echoed from the query
    pub limit: u64,
}

impl PaginatedResult {
    /// Empty page for a query.
    pub fn empty(query: &QueryDescriptor) -> Self {
        Self {
            data: Vec::new(),
            total: 0,
            page: query.page,
            limit: query.limit,
        }
    }
}

/// Total order over JSON scalars used for in-process sorting.
///
/// Absent and null sort first, then booleans, numbers and strings.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = x.as_f64().unwrap_or(f64::NAN);
                    let y = y.as_f64().unwrap_or(f64::NAN);
                    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                }
            }
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_defaults() {
        let query = QueryDescriptor::new();
        assert_eq!(query.page, 1);
        assert_eq!(query.limit, 10);
        assert_eq!(query.offset(), 0);
        assert!(query.validate_paging().is_ok());
    }

    #[test]
    fn test_query_chain() {
        let query = QueryDescriptor::new()
            .filter("userId", "u1")
            .filter("logLevel", "WARN")
            .include(Include::new("user").required())
            .order_by("timestamp", SortDirection::Desc)
            .page(3)
            .limit(5);

        assert_eq!(query.where_["userId"], json!("u1"));
        assert_eq!(query.offset(), 10);
        assert!(query.include[0].required);

        let stripped = query.without_include_and_order();
        assert!(stripped.include.is_empty());
        assert!(stripped.order.is_empty());
        assert_eq!(stripped.where_.len(), 2);
        assert_eq!(stripped.page, 3);
    }

    #[test]
    fn test_zero_paging_rejected() {
        assert!(matches!(
            QueryDescriptor::new().page(0).validate_paging(),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            QueryDescriptor::new().limit(0).validate_paging(),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_query_deserializes_with_defaults() {
        let query: QueryDescriptor =
            serde_json::from_str(r#"{"where": {"action": "LOGIN"}, "order": [["createdAt", "DESC"]]}"#)
                .unwrap();
        assert_eq!(query.where_["action"], json!("LOGIN"));
        assert_eq!(query.order[0], ("createdAt".to_string(), SortDirection::Desc));
        assert_eq!(query.page, 1);
        assert_eq!(query.limit, 10);
    }

    #[test]
    fn test_compare_values() {
        assert_eq!(compare_values(None, Some(&json!(1))), Ordering::Less);
        assert_eq!(compare_values(Some(&json!(2)), Some(&json!(10))), Ordering::Less);
        assert_eq!(compare_values(Some(&json!(2.5)), Some(&json!(2))), Ordering::Greater);
        assert_eq!(compare_values(Some(&json!("b")), Some(&json!("a"))), Ordering::Greater);
        assert_eq!(compare_values(Some(&Value::Null), None), Ordering::Equal);
        assert_eq!(SortDirection::Desc.apply(Ordering::Less), Ordering::Greater);
    }
}
