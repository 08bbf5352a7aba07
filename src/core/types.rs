//! Common types used across storage modules.

use chrono::{DateTime, Duration, Months, SecondsFormat, Utc};

/// Timestamp wrapper for consistent serialization.
pub type Timestamp = DateTime<Utc>;

/// Get current UTC timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Render a timestamp in the canonical persisted form.
///
/// RFC 3339, UTC, nanosecond precision, `Z` suffix. The output is fixed-width,
/// so string order equals chronological order.
pub fn canonical_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse any RFC 3339 timestamp into UTC.
pub fn parse_timestamp(s: &str) -> Option<Timestamp> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Default retention threshold: now minus three calendar months.
pub fn default_retention_threshold() -> Timestamp {
    let now = now();
    now.checked_sub_months(Months::new(3))
        .unwrap_or_else(|| now - Duration::days(90))
}

/// Serde adapter writing optional timestamps in canonical form.
pub mod canonical_ts {
    use super::{canonical_timestamp, parse_timestamp, Timestamp};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Timestamp>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_some(&canonical_timestamp(ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Timestamp>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(s) => parse_timestamp(&s)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp: {s}"))),
            None => Ok(None),
        }
    }
}
