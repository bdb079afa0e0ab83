use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::{debug, info, warn};

use super::Task;
use crate::health::HealthMetrics;
use crate::model::record::fold_events;
use crate::model::{Event, Level};
use crate::store::{
    node_labels, series_labels, Datapoint, DurableStore, FetchQuery, CHECKPOINT_CLASS,
    CHECKPOINT_MASTER_CLASS, EVENT_CLASS,
};

/// Watermark lag when none is configured.
pub const DEFAULT_LAG: Duration = Duration::from_secs(300);

/// Classes one event-folding pass reads and writes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FoldClasses {
    pub source: &'static str,
    pub target: &'static str,
    pub master: &'static str,
    /// Metric label for records written.
    pub kind: &'static str,
}

pub(crate) const CHECKPOINT: FoldClasses = FoldClasses {
    source: EVENT_CLASS,
    target: CHECKPOINT_CLASS,
    master: CHECKPOINT_MASTER_CLASS,
    kind: "checkpoint",
};

/// Latest master timestamp written for `node`, at any time.
pub(crate) async fn last_master<S: DurableStore>(
    store: &S,
    master_class: &str,
    node: &str,
) -> Result<Option<i64>> {
    let query = FetchQuery::new(master_class, node_labels(node), i64::MIN, i64::MAX).last(1);
    let found = store
        .fetch(&query)
        .await
        .with_context(|| format!("reading {master_class} for node {node}"))?;
    Ok(found.iter().map(|dp| dp.timestamp).max())
}

/// Fold raw events since the node's last pass into one record per indexed
/// label set, stamped at `watermark`.
///
/// The records and the master marker go out in a single ingest, and nothing
/// is written when the window holds no activity. A second pass at the same
/// watermark therefore finds its boundary already there and does nothing.
pub(crate) async fn fold_since_last<S: DurableStore>(
    store: &S,
    node: &str,
    classes: FoldClasses,
    watermark: i64,
) -> Result<usize> {
    let boundary = last_master(store, classes.master, node).await?;
    if boundary.is_some_and(|b| b >= watermark) {
        debug!(class = classes.target, ?boundary, watermark, "already compacted to watermark");
        return Ok(0);
    }
    let start = boundary.unwrap_or(i64::MIN);

    let raw = store
        .fetch(&FetchQuery::new(classes.source, node_labels(node), start, watermark))
        .await
        .with_context(|| format!("fetching {} for node {node}", classes.source))?;

    let mut events = Vec::with_capacity(raw.len());
    for dp in &raw {
        match serde_json::from_value::<Event>(dp.value.clone()) {
            Ok(event) => events.push(event),
            Err(e) => warn!(
                class = classes.source,
                timestamp = dp.timestamp,
                error = %e,
                "skipping undecodable event",
            ),
        }
    }

    let mut records = Vec::new();
    for ((level, resource), record) in fold_events(&events, &Level::INDEXED) {
        if record.is_empty() {
            continue;
        }
        records.push(Datapoint::record(
            classes.target,
            series_labels(node, level.label(), &resource),
            watermark,
            &record,
        )?);
    }

    if records.is_empty() {
        debug!(class = classes.target, start, watermark, "no activity to compact");
        return Ok(0);
    }

    let written_records = records.len();
    records.push(Datapoint::new(
        classes.master,
        node_labels(node),
        watermark,
        json!({ "records": written_records, "events": events.len() }),
    ));

    let expected = records.len();
    let written = store
        .ingest(&records)
        .await
        .with_context(|| format!("writing {} records", classes.target))?;
    if written != expected {
        bail!("store wrote {written} of {expected} {} records", classes.target);
    }

    Ok(written_records)
}

/// Rolls raw events up into per-label-set checkpoints.
pub struct CheckpointTask<S> {
    store: Arc<S>,
    node_id: String,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<S: DurableStore> CheckpointTask<S> {
    pub fn new(store: Arc<S>, node_id: &str) -> Self {
        Self {
            store,
            node_id: node_id.to_string(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl<S: DurableStore> Task for CheckpointTask<S> {
    fn name(&self) -> &'static str {
        "checkpoint"
    }

    fn default_lag(&self) -> Duration {
        DEFAULT_LAG
    }

    async fn execute(&self, watermark: i64) -> Result<()> {
        debug!(watermark, node = %self.node_id, "creating checkpoints");

        let created = fold_since_last(self.store.as_ref(), &self.node_id, CHECKPOINT, watermark).await?;
        if created > 0 {
            info!(checkpoints = created, watermark, "created checkpoints");
            if let Some(m) = &self.metrics {
                m.compaction_records
                    .with_label_values(&[CHECKPOINT.kind])
                    .inc_by(created as f64);
            }
        }
        Ok(())
    }
}
