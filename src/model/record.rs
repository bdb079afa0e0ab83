use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Event, Level};

/// Aggregate over a label set and a time window.
///
/// Checkpoints, snapshots and corrections all share this shape. Values may be
/// negative internally; use [`Record::clamped`] before showing them to users.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(default)]
    pub object_delta: i64,
    #[serde(default)]
    pub size_delta: i64,
    #[serde(default)]
    pub incoming_bytes: i64,
    #[serde(default)]
    pub outgoing_bytes: i64,
    /// Operation counts keyed by operation wire name.
    #[serde(default)]
    pub operations: BTreeMap<String, i64>,
}

impl Record {
    /// Add one event to the aggregate.
    pub fn fold_event(&mut self, event: &Event) {
        self.object_delta += event.object_delta.unwrap_or(0);
        self.size_delta += event.size_delta.unwrap_or(0);
        self.incoming_bytes += event.incoming_bytes.unwrap_or(0);
        self.outgoing_bytes += event.outgoing_bytes.unwrap_or(0);
        if event.operation_id.is_request() {
            *self
                .operations
                .entry(event.operation_id.normalize().as_str().to_string())
                .or_insert(0) += 1;
        }
    }

    /// Add another aggregate into this one.
    pub fn merge(&mut self, other: &Record) {
        self.object_delta += other.object_delta;
        self.size_delta += other.size_delta;
        self.incoming_bytes += other.incoming_bytes;
        self.outgoing_bytes += other.outgoing_bytes;
        for (op, count) in &other.operations {
            *self.operations.entry(op.clone()).or_insert(0) += count;
        }
    }

    /// True when the record carries no activity at all.
    pub fn is_empty(&self) -> bool {
        self.object_delta == 0
            && self.size_delta == 0
            && self.incoming_bytes == 0
            && self.outgoing_bytes == 0
            && self.operations.values().all(|c| *c == 0)
    }

    /// Copy with every negative value raised to zero.
    pub fn clamped(&self) -> Record {
        Record {
            object_delta: self.object_delta.max(0),
            size_delta: self.size_delta.max(0),
            incoming_bytes: self.incoming_bytes.max(0),
            outgoing_bytes: self.outgoing_bytes.max(0),
            operations: self
                .operations
                .iter()
                .map(|(op, c)| (op.clone(), (*c).max(0)))
                .collect(),
        }
    }
}

/// Fold events into one record per (level, resource) for each of `levels`.
///
/// Events without a value for a level do not contribute to that level.
pub fn fold_events<'a, I>(events: I, levels: &[Level]) -> BTreeMap<(Level, String), Record>
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut out: BTreeMap<(Level, String), Record> = BTreeMap::new();

    for event in events {
        for level in levels {
            if let Some(resource) = event.label_value(*level) {
                out.entry((*level, resource.to_string()))
                    .or_default()
                    .fold_event(event);
            }
        }
    }

    out
}
