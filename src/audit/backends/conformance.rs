//! Shared behaviour checks run against every backend.

use crate::audit::backend::AuditStorage;
use crate::audit::entry::{AuditRecord, LogLevel, RecordId, RecordPatch};
use crate::audit::filter::{QueryDescriptor, SortDirection};
use crate::audit::schema::{ExtensionField, FieldType, SchemaConfig};
use crate::core::{now, Error};
use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio_test::{assert_err, assert_ok};

/// Schema used by the conformance scenarios.
pub fn schema() -> SchemaConfig {
    SchemaConfig::new()
        .with_extension(ExtensionField::new("region", FieldType::Text, "eu"))
        .with_extension(ExtensionField::new("shard", FieldType::Integer, 3))
}

fn by_user(user: &str) -> BTreeMap<String, Value> {
    let mut filter = BTreeMap::new();
    filter.insert("userId".to_string(), json!(user));
    filter
}

/// Run every scenario. Scenarios use disjoint users so they can share one backend.
pub async fn run_all(storage: &dyn AuditStorage) {
    round_trip(storage).await;
    extension_override(storage).await;
    concrete_scenario(storage).await;
    exact_match(storage).await;
    pagination(storage).await;
    idempotent_delete(storage).await;
    update(storage).await;
    duplicate_id(storage).await;
    invalid_queries(storage).await;
    null_matches_absent(storage).await;
    ordering(storage).await;
    backfilled_creation_order(storage).await;
    retention_boundary(storage).await;
    fetch_all(storage).await;
}

async fn round_trip(storage: &dyn AuditStorage) {
    let timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap() + Duration::nanoseconds(123_456);
    let record = AuditRecord::new("rt-user", "EXPORT", LogLevel::Debug)
        .with_timestamp(timestamp)
        .with_metadata(json!({"file": "report.csv", "rows": 12, "tags": ["a", "b"]}));

    let id = assert_ok!(storage.log_event(record).await);
    let found = storage
        .fetch_log(&QueryDescriptor::new().filter("id", id.as_str()))
        .await
        .unwrap()
        .expect("record should exist");

    assert_eq!(found.id, Some(id));
    assert_eq!(found.user_id, "rt-user");
    assert_eq!(found.action, "EXPORT");
    assert_eq!(found.log_level, LogLevel::Debug);
    assert_eq!(found.timestamp, Some(timestamp));
    assert!(found.created_at.is_some());
    assert_eq!(
        found.metadata,
        Some(json!({"file": "report.csv", "rows": 12, "tags": ["a", "b"]}))
    );
    assert_eq!(found.extensions["region"], json!("eu"));
    assert_eq!(found.extensions["shard"], json!(3));
}

async fn extension_override(storage: &dyn AuditStorage) {
    let record = AuditRecord::new("ext-user", "LOGIN", LogLevel::Info)
        .with_extension("region", "us")
        .with_extension("undeclared", true);
    storage.log_event(record).await.unwrap();

    let found = storage
        .fetch_log(&QueryDescriptor::new().filter("userId", "ext-user"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.extensions.len(), 2);
    assert_eq!(found.extensions["region"], json!("eu"));
    assert!(!found.extensions.contains_key("undeclared"));

    let mut by_region = by_user("ext-user");
    by_region.insert("region".to_string(), json!("eu"));
    assert_eq!(storage.count_logs(&by_region).await.unwrap(), 1);
    by_region.insert("region".to_string(), json!("us"));
    assert_eq!(storage.count_logs(&by_region).await.unwrap(), 0);
}

async fn concrete_scenario(storage: &dyn AuditStorage) {
    storage
        .log_event(AuditRecord::new("u1", "LOGIN", LogLevel::Info))
        .await
        .unwrap();
    storage
        .log_event(AuditRecord::new("u1", "LOGOUT", LogLevel::Info))
        .await
        .unwrap();

    assert_eq!(storage.count_logs(&by_user("u1")).await.unwrap(), 2);

    let page = storage
        .fetch_logs(&QueryDescriptor::new().filter("userId", "u1").page(1).limit(1))
        .await
        .unwrap();
    assert_eq!(page.data.len(), 1);
    assert_eq!(page.total, 2);
    assert_eq!(page.page, 1);
    assert_eq!(page.limit, 1);
}

async fn exact_match(storage: &dyn AuditStorage) {
    for action in ["LOGIN", "LOGIN_FAILED", "LOGIN_FAILED"] {
        storage
            .log_event(AuditRecord::new("em-user", action, LogLevel::Warn))
            .await
            .unwrap();
    }

    let page = storage
        .fetch_logs(
            &QueryDescriptor::new()
                .filter("userId", "em-user")
                .filter("action", "LOGIN"),
        )
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert!(page.data.iter().all(|r| r.action == "LOGIN"));

    let mut by_level = by_user("em-user");
    by_level.insert("logLevel".to_string(), json!("WARN"));
    assert_eq!(storage.count_logs(&by_level).await.unwrap(), 3);
}

async fn pagination(storage: &dyn AuditStorage) {
    let base = now() - Duration::days(1);
    let n = 7u64;
    for i in 0..n {
        storage
            .log_event(
                AuditRecord::new("page-user", &format!("A{i}"), LogLevel::Info)
                    .with_created_at(base + Duration::milliseconds(i as i64)),
            )
            .await
            .unwrap();
    }

    let limit = 3u64;
    let mut seen = Vec::new();
    for page in 1..=n.div_ceil(limit) + 1 {
        let result = storage
            .fetch_logs(
                &QueryDescriptor::new()
                    .filter("userId", "page-user")
                    .page(page)
                    .limit(limit),
            )
            .await
            .unwrap();
        assert_eq!(result.total, n);
        let expected_len = n.saturating_sub((page - 1) * limit).min(limit);
        assert_eq!(result.data.len() as u64, expected_len, "page {page}");
        seen.extend(result.data.into_iter().map(|r| r.action));
    }
    let expected: Vec<_> = (0..n).map(|i| format!("A{i}")).collect();
    assert_eq!(seen, expected);
}

async fn idempotent_delete(storage: &dyn AuditStorage) {
    let id = storage
        .log_event(AuditRecord::new("del-user", "LOGIN", LogLevel::Info))
        .await
        .unwrap();

    assert_ok!(storage.delete_log(&id).await);
    assert_ok!(storage.delete_log(&id).await);
    assert_ok!(storage.delete_log(&RecordId::new("never-existed")).await);

    let found = storage
        .fetch_log(&QueryDescriptor::new().filter("id", id.as_str()))
        .await
        .unwrap();
    assert!(found.is_none());
}

async fn update(storage: &dyn AuditStorage) {
    let id = storage
        .log_event(
            AuditRecord::new("upd-user", "LOGIN", LogLevel::Info).with_metadata(json!({"n": 1})),
        )
        .await
        .unwrap();
    let before = storage
        .fetch_log(&QueryDescriptor::new().filter("id", id.as_str()))
        .await
        .unwrap()
        .unwrap();

    storage
        .update_log(
            &id,
            RecordPatch::new()
                .action("LOGOUT")
                .log_level(LogLevel::Error)
                .metadata(json!({"n": 2})),
        )
        .await
        .unwrap();

    let after = storage
        .fetch_log(&QueryDescriptor::new().filter("id", id.as_str()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.user_id, "upd-user");
    assert_eq!(after.action, "LOGOUT");
    assert_eq!(after.log_level, LogLevel::Error);
    assert_eq!(after.metadata, Some(json!({"n": 2})));
    assert_eq!(after.created_at, before.created_at);
    assert_eq!(after.extensions["region"], json!("eu"));

    assert_ok!(
        storage
            .update_log(&RecordId::new("never-existed"), RecordPatch::new().action("X"))
            .await
    );
    let ghost = storage
        .fetch_log(&QueryDescriptor::new().filter("id", "never-existed"))
        .await
        .unwrap();
    assert!(ghost.is_none());
}

async fn duplicate_id(storage: &dyn AuditStorage) {
    let record = AuditRecord::new("dup-user", "LOGIN", LogLevel::Info).with_id("dup-1");
    let id = storage.log_event(record.clone()).await.unwrap();
    assert_eq!(id.as_str(), "dup-1");

    let err = assert_err!(storage.log_event(record).await);
    assert!(matches!(err, Error::DuplicateId(_)), "{err}");
    assert_eq!(storage.count_logs(&by_user("dup-user")).await.unwrap(), 1);
}

async fn invalid_queries(storage: &dyn AuditStorage) {
    let unknown = storage
        .fetch_logs(&QueryDescriptor::new().filter("colour", "red"))
        .await;
    assert!(matches!(unknown, Err(Error::InvalidQuery(_))));

    let metadata = storage
        .count_logs(&{
            let mut filter = BTreeMap::new();
            filter.insert("metadata".to_string(), json!({}));
            filter
        })
        .await;
    assert!(matches!(metadata, Err(Error::InvalidQuery(_))));

    let zero_page = storage.find_all(&QueryDescriptor::new().page(0)).await;
    assert!(matches!(zero_page, Err(Error::InvalidQuery(_))));

    let bad_order = storage
        .find_all(&QueryDescriptor::new().order_by("colour", SortDirection::Asc))
        .await;
    assert!(matches!(bad_order, Err(Error::InvalidQuery(_))));

    let bad_level = storage
        .fetch_logs(&QueryDescriptor::new().filter("logLevel", "LOUD"))
        .await;
    assert!(matches!(bad_level, Err(Error::InvalidQuery(_))));
}

async fn null_matches_absent(storage: &dyn AuditStorage) {
    storage
        .log_event(AuditRecord::new("null-user", "A", LogLevel::Info))
        .await
        .unwrap();
    storage
        .log_event(AuditRecord::new("null-user", "B", LogLevel::Info).with_timestamp(now()))
        .await
        .unwrap();

    let page = storage
        .fetch_logs(
            &QueryDescriptor::new()
                .filter("userId", "null-user")
                .filter("timestamp", Value::Null),
        )
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.data[0].action, "A");
}

async fn ordering(storage: &dyn AuditStorage) {
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    for (action, offset) in [("second", 2), ("first", 1), ("third", 3)] {
        storage
            .log_event(
                AuditRecord::new("ord-user", action, LogLevel::Info)
                    .with_timestamp(base + Duration::minutes(offset)),
            )
            .await
            .unwrap();
    }

    let page = storage
        .find_all(
            &QueryDescriptor::new()
                .filter("userId", "ord-user")
                .order_by("timestamp", SortDirection::Desc),
        )
        .await
        .unwrap();
    let actions: Vec<_> = page.data.iter().map(|r| r.action.as_str()).collect();
    assert_eq!(actions, vec!["third", "second", "first"]);

    // fetch_logs ignores order and keeps creation order
    let unordered = storage
        .fetch_logs(
            &QueryDescriptor::new()
                .filter("userId", "ord-user")
                .order_by("timestamp", SortDirection::Desc),
        )
        .await
        .unwrap();
    assert_eq!(unordered.data[0].action, "second");
}

async fn backfilled_creation_order(storage: &dyn AuditStorage) {
    let now = now();
    storage
        .log_event(AuditRecord::new("backfill-user", "newer", LogLevel::Info).with_created_at(now))
        .await
        .unwrap();
    storage
        .log_event(
            AuditRecord::new("backfill-user", "older", LogLevel::Info)
                .with_created_at(now - Duration::days(1)),
        )
        .await
        .unwrap();

    let query = QueryDescriptor::new().filter("userId", "backfill-user");
    let page = storage.fetch_logs(&query).await.unwrap();
    let actions: Vec<_> = page.data.iter().map(|r| r.action.as_str()).collect();
    assert_eq!(actions, vec!["older", "newer"]);

    let first = storage.fetch_log(&query).await.unwrap().unwrap();
    assert_eq!(first.action, "older");

    // equal sort keys fall back to the creation instant
    let tied = storage
        .find_all(&query.clone().order_by("userId", SortDirection::Desc).limit(1))
        .await
        .unwrap();
    assert_eq!(tied.total, 2);
    assert_eq!(tied.data[0].action, "older");
}

async fn retention_boundary(storage: &dyn AuditStorage) {
    let now = now();
    for (action, age) in [("fresh", 1), ("stale", 91), ("ancient", 100)] {
        storage
            .log_event(
                AuditRecord::new("ret-user", action, LogLevel::Info)
                    .with_created_at(now - Duration::days(age)),
            )
            .await
            .unwrap();
    }

    let removed = storage
        .delete_logs_older_than(Some(now - Duration::days(90)))
        .await
        .unwrap();
    assert_eq!(removed, 2);

    let left = storage
        .fetch_logs(&QueryDescriptor::new().filter("userId", "ret-user"))
        .await
        .unwrap();
    assert_eq!(left.total, 1);
    assert_eq!(left.data[0].action, "fresh");

    assert_eq!(storage.delete_logs_older_than(None).await.unwrap(), 0);
}

async fn fetch_all(storage: &dyn AuditStorage) {
    let all = storage.fetch_all_logs().await.unwrap();
    let total = storage.count_logs(&BTreeMap::new()).await.unwrap();
    assert_eq!(all.len() as u64, total);
    assert!(all.iter().all(|r| r.id.is_some() && r.created_at.is_some()));

    let first_page_action = all
        .iter()
        .find(|r| r.user_id == "page-user")
        .map(|r| r.action.as_str());
    assert_eq!(first_page_action, Some("A0"));
}
