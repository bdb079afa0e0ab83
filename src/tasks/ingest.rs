use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::Task;
use crate::cache::{CacheBackend, ShardCache};
use crate::health::HealthMetrics;
use crate::model::clock::{now_micros, InterpolatedClock};
use crate::model::{duration_micros, Event};
use crate::store::{
    node_labels, Datapoint, DurableStore, FetchQuery, EVENT_CLASS, REPAIR_EVENT_CLASS,
};

/// Shards drained concurrently within one execution.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Raised when the store did not accept every record of a shard.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IngestError {
    #[error("store wrote {written} of {expected} records from shard {shard}")]
    CountMismatch {
        shard: i64,
        expected: usize,
        written: usize,
    },
}

/// Moves ready shards from the cache into the durable store.
pub struct IngestShardTask<B, S> {
    shared: Arc<Shared<B, S>>,
}

struct Shared<B, S> {
    cache: Arc<ShardCache<B>>,
    store: Arc<S>,
    node_id: String,
    checkpoint_lag: Duration,
    concurrency: usize,
    metrics: Option<Arc<HealthMetrics>>,
    /// Stamps for this node's event series. Seeded from the newest stored
    /// event on first use, so a late event can never reuse a stored stamp.
    event_clock: tokio::sync::Mutex<Option<InterpolatedClock>>,
    /// Repair-class events are restamped at ingestion time; one clock across
    /// runs keeps those stamps unique per node.
    repair_clock: Mutex<InterpolatedClock>,
}

/// Outcome of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardOutcome {
    Empty,
    Ingested { records: usize, slow: bool },
}

impl<B: CacheBackend, S: DurableStore> IngestShardTask<B, S> {
    pub fn new(
        cache: Arc<ShardCache<B>>,
        store: Arc<S>,
        node_id: &str,
        checkpoint_lag: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                cache,
                store,
                node_id: node_id.to_string(),
                checkpoint_lag,
                concurrency: DEFAULT_CONCURRENCY,
                metrics: None,
                event_clock: tokio::sync::Mutex::new(None),
                repair_clock: Mutex::new(InterpolatedClock::new()),
            }),
        }
    }

    /// Must be called before the task is shared.
    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.metrics = Some(metrics);
        }
        self
    }

    /// Maximum shards in flight. Must be called before the task is shared.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.concurrency = concurrency.max(1);
        }
        self
    }
}

impl<B: CacheBackend, S: DurableStore> Task for IngestShardTask<B, S> {
    fn name(&self) -> &'static str {
        "ingest"
    }

    fn default_lag(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn execute(&self, watermark: i64) -> Result<()> {
        let shared = &self.shared;
        let end_shard = shared.cache.shard_for(watermark);

        let ready: Vec<i64> = shared
            .cache
            .get_shards()
            .await
            .context("listing cache shards")?
            .into_iter()
            .filter(|shard| *shard <= end_shard)
            .collect();

        if ready.is_empty() {
            debug!(end_shard, "no shards ready to ingest");
            return Ok(());
        }

        debug!(end_shard, shards = ready.len(), "ingesting shards");

        let semaphore = Arc::new(Semaphore::new(shared.concurrency));
        let mut in_flight = JoinSet::new();

        for shard in ready {
            let shared = Arc::clone(shared);
            let semaphore = Arc::clone(&semaphore);

            in_flight.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .context("ingest semaphore closed")?;
                shared
                    .ingest_shard(shard)
                    .await
                    .map(|outcome| (shard, outcome))
            });
        }

        let mut first_err = None;
        let mut ingested = 0usize;

        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(Ok((_, ShardOutcome::Ingested { records, .. }))) => ingested += records,
                Ok(Ok((shard, ShardOutcome::Empty))) => {
                    debug!(shard, "skipped empty shard");
                }
                Ok(Err(e)) => {
                    error!(error = %format!("{e:#}"), "shard ingestion failed");
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "shard ingestion panicked");
                    first_err.get_or_insert(e.into());
                }
            }
        }

        if ingested > 0 {
            info!(records = ingested, node = %shared.node_id, "ingested shards");
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<B: CacheBackend, S: DurableStore> Shared<B, S> {
    async fn ingest_shard(&self, shard: i64) -> Result<ShardOutcome> {
        if !self.cache.shard_exists(shard).await? {
            warn!(shard, "shard does not exist");
            return Ok(ShardOutcome::Empty);
        }

        let mut events = self
            .cache
            .get_metrics_for_shard(shard)
            .await
            .with_context(|| format!("reading shard {shard}"))?;

        if events.is_empty() {
            return Ok(ShardOutcome::Empty);
        }

        let read: Vec<String> = events.iter().map(|e| e.uuid.clone()).collect();

        let now = now_micros();
        let age = now - shard;
        let slow = age >= duration_micros(self.checkpoint_lag);

        let class = if slow {
            info!(shard, age_s = age / 1_000_000, "detected slow shard, ingesting as repair");
            self.restamp(&mut events, now);
            REPAIR_EVENT_CLASS
        } else {
            self.stamp_events(&mut events).await?;
            EVENT_CLASS
        };

        let records = to_datapoints(class, &self.node_id, &events)?;
        let expected = records.len();

        let written = self
            .store
            .ingest(&records)
            .await
            .with_context(|| format!("ingesting shard {shard}"))?;

        if written != expected {
            return Err(IngestError::CountMismatch {
                shard,
                expected,
                written,
            }
            .into());
        }

        let left = self
            .cache
            .remove_events(shard, &read)
            .await
            .with_context(|| format!("removing ingested events from shard {shard}"))?;
        if left > 0 {
            debug!(shard, left, "shard received events during ingestion, keeping it");
        }

        if let Some(m) = &self.metrics {
            m.ingest_events.inc_by(written as f64);
            if slow {
                m.ingest_slow_events.inc_by(written as f64);
            }
            m.ingest_shards.inc();
            m.ingest_shard_age_seconds.inc_by(age.max(0) as f64 / 1_000_000.0);
        }

        debug!(shard, records = written, class, "ingested shard");
        Ok(ShardOutcome::Ingested {
            records: written,
            slow,
        })
    }

    /// Stamp events past everything already in this node's event series.
    async fn stamp_events(&self, events: &mut [Event]) -> Result<()> {
        let mut slot = self.event_clock.lock().await;
        if slot.is_none() {
            let newest = self
                .store
                .fetch(
                    &FetchQuery::new(EVENT_CLASS, node_labels(&self.node_id), i64::MIN, i64::MAX)
                        .last(1),
                )
                .await
                .context("reading newest stored event")?;
            let last = newest.last().map(|d| d.timestamp);
            debug!(node = %self.node_id, ?last, "seeded event clock");
            *slot = Some(InterpolatedClock::resume_after(last));
        }
        if let Some(clock) = slot.as_mut() {
            clock.stamp(events);
        }
        Ok(())
    }

    /// Order events by their own time, then stamp them at `now` onwards.
    fn restamp(&self, events: &mut [Event], now: i64) {
        events.sort_by_key(|e| e.timestamp);
        let mut clock = self.repair_clock.lock();
        for event in events.iter_mut() {
            event.timestamp = clock.next(now);
        }
    }
}

fn to_datapoints(class: &str, node_id: &str, events: &[Event]) -> Result<Vec<Datapoint>> {
    let labels = node_labels(node_id);
    events
        .iter()
        .map(|event| -> Result<Datapoint> {
            let value = serde_json::to_value(event).context("encoding event")?;
            Ok(Datapoint::new(class, labels.clone(), event.timestamp, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;
    use crate::model::OperationId;
    use crate::store::{FetchQuery, MemoryStore};

    const LAG: Duration = Duration::from_secs(300);

    fn setup() -> (Arc<ShardCache<MemoryBackend>>, Arc<MemoryStore>) {
        let cache = Arc::new(ShardCache::new(
            MemoryBackend::new(Duration::from_secs(3600)),
            Duration::from_secs(10),
        ));
        (cache, Arc::new(MemoryStore::new()))
    }

    fn event(uuid: &str, ts: i64) -> Event {
        let mut e = Event::new(OperationId::PutObject);
        e.uuid = uuid.to_string();
        e.timestamp = ts;
        e.account = Some("a1".to_string());
        e.size_delta = Some(1);
        e
    }

    #[tokio::test]
    async fn test_collisions_are_interpolated() {
        let (cache, store) = setup();
        let base = shard_aligned(now_micros() - 60_000_000);
        for (i, ts) in [base + 5, base + 5, base + 5, base + 2].iter().enumerate() {
            assert!(cache.push_metric(&event(&format!("e{i}"), *ts)).await);
        }

        let task = IngestShardTask::new(Arc::clone(&cache), Arc::clone(&store), "n1", LAG);
        task.execute(now_micros()).await.expect("execute");

        let got = store
            .fetch(&FetchQuery::new(EVENT_CLASS, node_labels("n1"), 0, i64::MAX))
            .await
            .expect("fetch");
        let ts: Vec<i64> = got.iter().map(|d| d.timestamp).collect();
        assert_eq!(ts, vec![base + 2, base + 5, base + 6, base + 7]);
        assert!(cache.get_shards().await.expect("shards").is_empty());
    }

    #[tokio::test]
    async fn test_shards_after_watermark_wait() {
        let (cache, store) = setup();
        let now = now_micros();
        assert!(cache.push_metric(&event("old", now - 60_000_000)).await);
        assert!(cache.push_metric(&event("new", now)).await);

        let task = IngestShardTask::new(Arc::clone(&cache), Arc::clone(&store), "n1", LAG);
        task.execute(now - 30_000_000).await.expect("execute");

        assert_eq!(store.len(), 1);
        let remaining = cache.get_shards().await.expect("shards");
        assert_eq!(remaining, vec![cache.shard_for(now)]);
    }

    #[tokio::test]
    async fn test_slow_shards_restamped_uniquely() {
        let (cache, store) = setup();
        let now = now_micros();
        // Two old shards, both past the checkpoint lag.
        for (i, ts) in [now - 400_000_000, now - 400_000_000, now - 500_000_000]
            .iter()
            .enumerate()
        {
            assert!(cache.push_metric(&event(&format!("s{i}"), *ts)).await);
        }

        let task = IngestShardTask::new(Arc::clone(&cache), Arc::clone(&store), "n1", LAG);
        task.execute(now).await.expect("execute");

        assert_eq!(store.class_len(EVENT_CLASS), 0);
        let got = store
            .fetch(&FetchQuery::new(REPAIR_EVENT_CLASS, node_labels("n1"), 0, i64::MAX))
            .await
            .expect("fetch");
        assert_eq!(got.len(), 3);
        assert!(got.iter().all(|d| d.timestamp >= now));
    }

    #[tokio::test]
    async fn test_restarted_task_stamps_after_stored_events() {
        let (cache, store) = setup();
        let base = shard_aligned(now_micros() - 60_000_000);

        assert!(cache.push_metric(&event("first", base + 5)).await);
        IngestShardTask::new(Arc::clone(&cache), Arc::clone(&store), "n1", LAG)
            .execute(now_micros())
            .await
            .expect("first run");

        // A fresh task knows nothing in memory and must read the store.
        assert!(cache.push_metric(&event("second", base + 5)).await);
        IngestShardTask::new(Arc::clone(&cache), Arc::clone(&store), "n1", LAG)
            .execute(now_micros())
            .await
            .expect("second run");

        let got = store
            .fetch(&FetchQuery::new(EVENT_CLASS, node_labels("n1"), 0, i64::MAX))
            .await
            .expect("fetch");
        let ts: Vec<i64> = got.iter().map(|d| d.timestamp).collect();
        assert_eq!(ts, vec![base + 5, base + 6]);
    }

    fn shard_aligned(ts: i64) -> i64 {
        ts - ts.rem_euclid(10_000_000)
    }
}
