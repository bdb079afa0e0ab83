use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use super::checkpoint::{fold_since_last, FoldClasses};
use super::Task;
use crate::health::HealthMetrics;
use crate::store::{DurableStore, CORRECTION_CLASS, CORRECTION_MASTER_CLASS, REPAIR_EVENT_CLASS};

pub(crate) const REPAIR: FoldClasses = FoldClasses {
    source: REPAIR_EVENT_CLASS,
    target: CORRECTION_CLASS,
    master: CORRECTION_MASTER_CLASS,
    kind: "correction",
};

/// Rolls late events up into corrections the read path adds on top of snapshots.
pub struct RepairTask<S> {
    store: Arc<S>,
    node_id: String,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<S: DurableStore> RepairTask<S> {
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

impl<S: DurableStore> Task for RepairTask<S> {
    fn name(&self) -> &'static str {
        "repair"
    }

    fn default_lag(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn execute(&self, watermark: i64) -> Result<()> {
        debug!(watermark, node = %self.node_id, "checking for repairs");

        let created = fold_since_last(self.store.as_ref(), &self.node_id, REPAIR, watermark).await?;
        if created > 0 {
            info!(corrections = created, watermark, "created corrections");
            if let Some(m) = &self.metrics {
                m.compaction_records
                    .with_label_values(&[REPAIR.kind])
                    .inc_by(created as f64);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::{Event, OperationId};
    use crate::store::{node_labels, Datapoint, FetchQuery, MemoryStore, CHECKPOINT_CLASS};

    fn repair_dp(ts: i64, size: i64) -> Datapoint {
        let mut e = Event::new(OperationId::DeleteObject);
        e.uuid = format!("r{ts}");
        e.timestamp = ts;
        e.account = Some("a1".to_string());
        e.size_delta = Some(size);
        Datapoint::new(
            REPAIR_EVENT_CLASS,
            node_labels("n1"),
            ts,
            serde_json::to_value(&e).expect("encode"),
        )
    }

    #[tokio::test]
    async fn test_repair_writes_corrections_only() {
        let store = Arc::new(MemoryStore::new());
        store
            .ingest(&[repair_dp(10, -30), repair_dp(11, -20)])
            .await
            .expect("ingest");

        let task = RepairTask::new(Arc::clone(&store), "n1");
        task.execute(100).await.expect("execute");

        assert_eq!(store.class_len(CHECKPOINT_CLASS), 0);
        let got = store
            .fetch(&FetchQuery::new(CORRECTION_CLASS, node_labels("n1"), i64::MIN, i64::MAX))
            .await
            .expect("fetch");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value["sizeDelta"], json!(-50));
        assert_eq!(got[0].value["operations"]["deleteObject"], json!(2));

        // Re-running at the same watermark writes nothing.
        let before = store.len();
        task.execute(100).await.expect("rerun");
        assert_eq!(store.len(), before);
    }
}
