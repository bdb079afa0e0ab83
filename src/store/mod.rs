//! Boundary to the durable time-series store.
//!
//! The store keeps one value per (class, label set, timestamp). Writing the
//! same key twice overwrites, which is what makes compaction re-runs safe and
//! why ingestion has to give every event a unique timestamp.

pub mod http;
pub mod memory;

use std::future::Future;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::{Labels, Record, NODE_LABEL};

pub use self::http::HttpStore;
pub use self::memory::MemoryStore;

/// Raw events ingested on time.
pub const EVENT_CLASS: &str = "meterd.event";
/// Raw events whose shard was ingested after its checkpoint window closed.
pub const REPAIR_EVENT_CLASS: &str = "meterd.repair.event";
pub const CHECKPOINT_CLASS: &str = "meterd.checkpoint";
/// Per-node marker holding the watermark the last checkpoint pass covered.
pub const CHECKPOINT_MASTER_CLASS: &str = "meterd.checkpoint.master";
pub const CORRECTION_CLASS: &str = "meterd.repair.checkpoint";
pub const CORRECTION_MASTER_CLASS: &str = "meterd.repair.master";
pub const SNAPSHOT_CLASS: &str = "meterd.snapshot";
pub const SNAPSHOT_MASTER_CLASS: &str = "meterd.snapshot.master";

/// Administrative procedures understood by every store.
pub mod procedure {
    /// Reject writes until unlocked.
    pub const LOCK: &str = "lock";
    pub const UNLOCK: &str = "unlock";
    /// Whether writes are currently rejected.
    pub const LOCKED: &str = "locked";
    /// Oldest datapoint timestamp, or null when empty. Params may carry
    /// `{"classes": [...]}` to search only those classes.
    pub const OLDEST: &str = "oldest";
}

/// One stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub class: String,
    pub labels: Labels,
    /// µs since epoch.
    pub timestamp: i64,
    pub value: serde_json::Value,
}

impl Datapoint {
    pub fn new(class: &str, labels: Labels, timestamp: i64, value: serde_json::Value) -> Self {
        Self {
            class: class.to_string(),
            labels,
            timestamp,
            value,
        }
    }

    /// Encode a record as a datapoint value.
    pub fn record(class: &str, labels: Labels, timestamp: i64, record: &Record) -> Result<Self> {
        let value = serde_json::to_value(record).context("encoding record")?;
        Ok(Self::new(class, labels, timestamp, value))
    }

    /// Decode the value as a record.
    pub fn to_record(&self) -> Result<Record> {
        serde_json::from_value(self.value.clone())
            .with_context(|| format!("decoding {} record at {}", self.class, self.timestamp))
    }

    /// Node that wrote this datapoint.
    pub fn node(&self) -> Option<&str> {
        self.labels.get(NODE_LABEL).map(String::as_str)
    }
}

/// Read selection: every series of `class` whose labels include `selector`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchQuery {
    pub class: String,
    #[serde(default)]
    pub selector: Labels,
    /// Exclusive lower bound.
    pub start: i64,
    /// Inclusive upper bound.
    pub end: i64,
    /// Keep only the newest N datapoints of each series.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<usize>,
}

impl FetchQuery {
    pub fn new(class: &str, selector: Labels, start: i64, end: i64) -> Self {
        Self {
            class: class.to_string(),
            selector,
            start,
            end,
            last: None,
        }
    }

    pub fn last(mut self, n: usize) -> Self {
        self.last = Some(n);
        self
    }
}

/// Delete selection. `class: None` matches every class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub selector: Labels,
    /// Exclusive lower bound.
    pub start: i64,
    /// Inclusive upper bound.
    pub end: i64,
}

/// Store primitives consumed by the tasks and the read path.
pub trait DurableStore: Send + Sync + 'static {
    /// Write datapoints, returning how many were stored.
    fn ingest(&self, records: &[Datapoint]) -> impl Future<Output = Result<usize>> + Send;

    /// Datapoints matching `query`, ordered by series then timestamp.
    fn fetch(&self, query: &FetchQuery) -> impl Future<Output = Result<Vec<Datapoint>>> + Send;

    /// Run a named server-side procedure.
    fn exec(
        &self,
        procedure: &str,
        params: serde_json::Value,
    ) -> impl Future<Output = Result<serde_json::Value>> + Send;

    /// Delete datapoints matching `query`, returning how many were removed.
    fn delete(&self, query: &DeleteQuery) -> impl Future<Output = Result<usize>> + Send;
}

/// Store adapter selected at startup.
pub enum Store {
    Memory(MemoryStore),
    Http(HttpStore),
}

impl DurableStore for Store {
    async fn ingest(&self, records: &[Datapoint]) -> Result<usize> {
        match self {
            Self::Memory(s) => s.ingest(records).await,
            Self::Http(s) => s.ingest(records).await,
        }
    }

    async fn fetch(&self, query: &FetchQuery) -> Result<Vec<Datapoint>> {
        match self {
            Self::Memory(s) => s.fetch(query).await,
            Self::Http(s) => s.fetch(query).await,
        }
    }

    async fn exec(&self, procedure: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        match self {
            Self::Memory(s) => s.exec(procedure, params).await,
            Self::Http(s) => s.exec(procedure, params).await,
        }
    }

    async fn delete(&self, query: &DeleteQuery) -> Result<usize> {
        match self {
            Self::Memory(s) => s.delete(query).await,
            Self::Http(s) => s.delete(query).await,
        }
    }
}

impl<S: DurableStore> DurableStore for std::sync::Arc<S> {
    async fn ingest(&self, records: &[Datapoint]) -> Result<usize> {
        self.as_ref().ingest(records).await
    }

    async fn fetch(&self, query: &FetchQuery) -> Result<Vec<Datapoint>> {
        self.as_ref().fetch(query).await
    }

    async fn exec(&self, procedure: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        self.as_ref().exec(procedure, params).await
    }

    async fn delete(&self, query: &DeleteQuery) -> Result<usize> {
        self.as_ref().delete(query).await
    }
}

/// Label set of one node's series at one level.
pub fn series_labels(node: &str, level_label: &str, resource: &str) -> Labels {
    let mut labels = Labels::new();
    labels.insert(NODE_LABEL.to_string(), node.to_string());
    labels.insert(level_label.to_string(), resource.to_string());
    labels
}

/// Label set of a node's master record.
pub fn node_labels(node: &str) -> Labels {
    let mut labels = Labels::new();
    labels.insert(NODE_LABEL.to_string(), node.to_string());
    labels
}
