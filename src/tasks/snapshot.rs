use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::{debug, info};

use super::checkpoint::last_master;
use super::Task;
use crate::health::HealthMetrics;
use crate::model::{Labels, Record};
use crate::store::{
    node_labels, Datapoint, DurableStore, FetchQuery, CHECKPOINT_CLASS, CORRECTION_CLASS,
    SNAPSHOT_CLASS, SNAPSHOT_MASTER_CLASS,
};

/// Folds the previous snapshot plus every checkpoint and correction since
/// into a new cumulative snapshot per label set.
///
/// Snapshot values are not clamped: corrections can drive a total below zero
/// and the read path clamps for display.
pub struct SnapshotTask<S> {
    store: Arc<S>,
    node_id: String,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<S: DurableStore> SnapshotTask<S> {
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

    async fn fetch_records(&self, class: &str, start: i64, end: i64) -> Result<Vec<Datapoint>> {
        self.store
            .fetch(&FetchQuery::new(class, node_labels(&self.node_id), start, end))
            .await
            .with_context(|| format!("fetching {class} for node {}", self.node_id))
    }

    async fn create_snapshots(&self, watermark: i64) -> Result<usize> {
        let node = self.node_id.as_str();
        let boundary = last_master(self.store.as_ref(), SNAPSHOT_MASTER_CLASS, node).await?;
        if boundary.is_some_and(|b| b >= watermark) {
            debug!(?boundary, watermark, "snapshots already at watermark");
            return Ok(0);
        }
        let start = boundary.unwrap_or(i64::MIN);

        let mut deltas: BTreeMap<Labels, Record> = BTreeMap::new();
        for class in [CHECKPOINT_CLASS, CORRECTION_CLASS] {
            for dp in self.fetch_records(class, start, watermark).await? {
                let record = dp.to_record()?;
                deltas.entry(dp.labels).or_default().merge(&record);
            }
        }
        deltas.retain(|_, record| !record.is_empty());

        if deltas.is_empty() {
            debug!(start, watermark, "no checkpoints to snapshot");
            return Ok(0);
        }

        let previous = match boundary {
            Some(b) => self
                .store
                .fetch(&FetchQuery::new(SNAPSHOT_CLASS, node_labels(node), i64::MIN, b).last(1))
                .await
                .context("fetching previous snapshots")?
                .into_iter()
                .map(|dp| -> Result<(Labels, Record)> {
                    let record = dp.to_record()?;
                    Ok((dp.labels, record))
                })
                .collect::<Result<BTreeMap<Labels, Record>>>()?,
            None => BTreeMap::new(),
        };

        let mut records = Vec::with_capacity(deltas.len() + 1);
        for (labels, delta) in deltas {
            let mut total = previous.get(&labels).cloned().unwrap_or_default();
            total.merge(&delta);
            records.push(Datapoint::record(SNAPSHOT_CLASS, labels, watermark, &total)?);
        }

        let created = records.len();
        records.push(Datapoint::new(
            SNAPSHOT_MASTER_CLASS,
            node_labels(node),
            watermark,
            json!({ "records": created }),
        ));

        let expected = records.len();
        let written = self
            .store
            .ingest(&records)
            .await
            .context("writing snapshots")?;
        if written != expected {
            bail!("store wrote {written} of {expected} snapshot records");
        }

        Ok(created)
    }
}

impl<S: DurableStore> Task for SnapshotTask<S> {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn default_lag(&self) -> Duration {
        Duration::from_secs(900)
    }

    async fn execute(&self, watermark: i64) -> Result<()> {
        debug!(watermark, node = %self.node_id, "creating snapshots");

        let created = self.create_snapshots(watermark).await?;
        if created > 0 {
            info!(snapshots = created, watermark, "created snapshots");
            if let Some(m) = &self.metrics {
                m.compaction_records
                    .with_label_values(&["snapshot"])
                    .inc_by(created as f64);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{series_labels, MemoryStore};

    fn record(size: i64) -> Record {
        Record {
            size_delta: size,
            object_delta: 1,
            ..Record::default()
        }
    }

    fn at(class: &str, ts: i64, size: i64) -> Datapoint {
        Datapoint::record(class, series_labels("n1", "acc", "a1"), ts, &record(size))
            .expect("encode")
    }

    async fn snapshots(store: &MemoryStore) -> Vec<(i64, i64)> {
        store
            .fetch(&FetchQuery::new(SNAPSHOT_CLASS, node_labels("n1"), i64::MIN, i64::MAX))
            .await
            .expect("fetch")
            .iter()
            .map(|dp| (dp.timestamp, dp.to_record().expect("decode").size_delta))
            .collect()
    }

    #[tokio::test]
    async fn test_snapshot_accumulates() {
        let store = Arc::new(MemoryStore::new());
        store
            .ingest(&[at(CHECKPOINT_CLASS, 10, 100), at(CHECKPOINT_CLASS, 20, 50)])
            .await
            .expect("ingest");

        let task = SnapshotTask::new(Arc::clone(&store), "n1");
        task.execute(100).await.expect("first");

        store
            .ingest(&[at(CHECKPOINT_CLASS, 150, -30), at(CORRECTION_CLASS, 160, 5)])
            .await
            .expect("ingest");
        task.execute(200).await.expect("second");

        assert_eq!(snapshots(&store).await, vec![(100, 150), (200, 125)]);
    }

    #[tokio::test]
    async fn test_snapshot_rerun_is_noop() {
        let store = Arc::new(MemoryStore::new());
        store.ingest(&[at(CHECKPOINT_CLASS, 10, 100)]).await.expect("ingest");

        let task = SnapshotTask::new(Arc::clone(&store), "n1");
        task.execute(100).await.expect("first");
        let before = store.len();
        task.execute(100).await.expect("second");
        assert_eq!(store.len(), before);
    }

    #[tokio::test]
    async fn test_snapshot_may_go_negative() {
        let store = Arc::new(MemoryStore::new());
        store
            .ingest(&[at(CHECKPOINT_CLASS, 10, 10), at(CORRECTION_CLASS, 20, -25)])
            .await
            .expect("ingest");

        let task = SnapshotTask::new(Arc::clone(&store), "n1");
        task.execute(100).await.expect("execute");
        assert_eq!(snapshots(&store).await, vec![(100, -15)]);
    }
}
