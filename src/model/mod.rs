pub mod clock;
pub mod operation;
pub mod record;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub use operation::OperationId;
pub use record::Record;

/// Label key/value pairs identifying one series in the durable store.
pub type Labels = BTreeMap<String, String>;

/// Label key carrying the id of the node that wrote a series.
pub const NODE_LABEL: &str = "node";

/// Timestamps below this are taken to be in seconds.
const SECONDS_CUTOFF: i64 = 10_000_000_000;
/// Timestamps below this (and above the seconds cutoff) are in milliseconds.
const MILLIS_CUTOFF: i64 = 10_000_000_000_000;

/// A single storage operation reported by a producer.
///
/// Events are immutable once accepted by the shard cache. Timestamps are
/// microseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub operation_id: OperationId,

    /// Producer-assigned idempotency key.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,

    #[serde(default)]
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incoming_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outgoing_bytes: Option<i64>,
}

impl Event {
    /// Create an event for `operation_id` with no identity and no deltas.
    pub fn new(operation_id: OperationId) -> Self {
        Self {
            operation_id,
            uuid: String::new(),
            timestamp: 0,
            bucket: None,
            object: None,
            version_id: None,
            account: None,
            user: None,
            location: None,
            object_delta: None,
            size_delta: None,
            incoming_bytes: None,
            outgoing_bytes: None,
        }
    }

    /// Assign a uuid and timestamp when the producer left them out, and
    /// promote second/millisecond timestamps to microseconds.
    pub fn ensure_identity(&mut self, now_us: i64) {
        if self.uuid.is_empty() {
            self.uuid = uuid::Uuid::new_v4().to_string();
        }

        if self.timestamp <= 0 {
            self.timestamp = now_us;
        } else {
            self.timestamp = normalize_timestamp(self.timestamp);
        }
    }

    /// Check the fields the ingestion pipeline depends on.
    pub fn validate(&self) -> Result<()> {
        if self.uuid.is_empty() {
            bail!("event uuid is required");
        }

        if self.timestamp <= 0 {
            bail!("event timestamp must be positive");
        }

        Ok(())
    }

    /// Value of the label for `level`, if the event carries one.
    pub fn label_value(&self, level: Level) -> Option<&str> {
        let value = match level {
            Level::Account => self.account.as_deref(),
            Level::User => self.user.as_deref(),
            Level::Bucket => self.bucket.as_deref(),
            Level::Location => self.location.as_deref(),
        };
        value.filter(|v| !v.is_empty())
    }

    pub fn size_delta(&self) -> i64 {
        self.size_delta.unwrap_or(0)
    }
}

/// Body of a storage query reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub storage_utilized: i64,
    pub number_of_objects: i64,
}

/// Resource level a series aggregates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Account,
    User,
    Bucket,
    Location,
}

impl Level {
    /// Levels that compaction keeps running totals for.
    pub const INDEXED: [Level; 3] = [Level::Account, Level::User, Level::Bucket];

    /// Short label key used in the durable store.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Account => "acc",
            Self::User => "usr",
            Self::Bucket => "bck",
            Self::Location => "loc",
        }
    }

    /// Plural service path segment (e.g. "accounts").
    pub const fn service(self) -> &'static str {
        match self {
            Self::Account => "accounts",
            Self::User => "users",
            Self::Bucket => "buckets",
            Self::Location => "locations",
        }
    }

    /// Parse a plural service path segment (e.g. "accounts").
    pub fn from_service(s: &str) -> Option<Self> {
        match s {
            "accounts" => Some(Self::Account),
            "users" => Some(Self::User),
            "buckets" => Some(Self::Bucket),
            "locations" => Some(Self::Location),
            _ => None,
        }
    }

    /// Find which level a series belongs to from its labels.
    pub fn from_labels(labels: &Labels) -> Option<(Self, &str)> {
        [Self::Account, Self::User, Self::Bucket, Self::Location]
            .into_iter()
            .find_map(|level| {
                labels
                    .get(level.label())
                    .map(|value| (level, value.as_str()))
            })
    }
}

/// Promote a second or millisecond precision timestamp to microseconds.
pub fn normalize_timestamp(ts: i64) -> i64 {
    if ts < SECONDS_CUTOFF {
        ts * 1_000_000
    } else if ts < MILLIS_CUTOFF {
        ts * 1_000
    } else {
        ts
    }
}

/// Shard containing `ts_us`: the start of its width-aligned bucket.
pub fn shard_from_timestamp(ts_us: i64, width: Duration) -> i64 {
    let width_us = i64::try_from(width.as_micros()).unwrap_or(i64::MAX).max(1);
    ts_us - ts_us.rem_euclid(width_us)
}

/// Convert a duration to whole microseconds, saturating.
pub fn duration_micros(d: Duration) -> i64 {
    i64::try_from(d.as_micros()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_is_camel_case() {
        let mut event = Event::new(OperationId::PutObject);
        event.uuid = "abc".to_string();
        event.timestamp = 1_600_000_000_000_000;
        event.account = Some("a1".to_string());
        event.size_delta = Some(100);
        event.object_delta = Some(1);

        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["operationId"], "putObject");
        assert_eq!(json["sizeDelta"], 100);
        assert_eq!(json["objectDelta"], 1);
        assert!(json.get("bucket").is_none());

        let back: Event = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn test_ensure_identity_fills_missing_fields() {
        let mut event = Event::new(OperationId::GetObject);
        event.ensure_identity(1_700_000_000_000_000);
        assert!(!event.uuid.is_empty());
        assert_eq!(event.timestamp, 1_700_000_000_000_000);
        event.validate().expect("valid after ensure_identity");
    }

    #[test]
    fn test_ensure_identity_keeps_existing_uuid() {
        let mut event = Event::new(OperationId::GetObject);
        event.uuid = "fixed".to_string();
        event.timestamp = 1_700_000_000;
        event.ensure_identity(0);
        assert_eq!(event.uuid, "fixed");
        assert_eq!(event.timestamp, 1_700_000_000_000_000);
    }

    #[test]
    fn test_validate_rejects_missing_uuid() {
        let mut event = Event::new(OperationId::GetObject);
        event.timestamp = 1;
        let err = event.validate().unwrap_err();
        assert!(err.to_string().contains("uuid"));
    }

    #[test]
    fn test_normalize_timestamp() {
        assert_eq!(normalize_timestamp(1_600_000_000), 1_600_000_000_000_000);
        assert_eq!(normalize_timestamp(1_600_000_000_123), 1_600_000_000_123_000);
        assert_eq!(
            normalize_timestamp(1_600_000_000_123_456),
            1_600_000_000_123_456
        );
    }

    #[test]
    fn test_shard_from_timestamp() {
        let width = Duration::from_secs(10);
        assert_eq!(shard_from_timestamp(1_600_000_009_999_999, width), 1_600_000_000_000_000);
        assert_eq!(shard_from_timestamp(1_600_000_010_000_000, width), 1_600_000_010_000_000);
        assert_eq!(shard_from_timestamp(0, width), 0);
    }

    #[test]
    fn test_label_value_ignores_empty() {
        let mut event = Event::new(OperationId::GetObject);
        event.bucket = Some(String::new());
        event.account = Some("acct".to_string());
        assert_eq!(event.label_value(Level::Bucket), None);
        assert_eq!(event.label_value(Level::Account), Some("acct"));
    }

    #[test]
    fn test_level_from_labels() {
        let mut labels = Labels::new();
        labels.insert(NODE_LABEL.to_string(), "n1".to_string());
        labels.insert("bck".to_string(), "photos".to_string());
        assert_eq!(Level::from_labels(&labels), Some((Level::Bucket, "photos")));
        assert_eq!(Level::from_service("users"), Some(Level::User));
        assert_eq!(Level::from_service("objects"), None);
    }
}
