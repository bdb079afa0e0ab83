//! Point-in-time reads over the compacted series.
//!
//! Each node's value at `t` is its state at the last snapshot pass before
//! `t` plus every checkpoint and correction written after that pass. Totals
//! stay signed internally and are clamped to zero only on the way out.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use tracing::debug;

use crate::cache::{CacheBackend, ShardCache};
use crate::model::{Labels, Level, Record};
use crate::store::{
    series_labels, DurableStore, FetchQuery, CHECKPOINT_CLASS, CHECKPOINT_MASTER_CLASS,
    CORRECTION_CLASS, CORRECTION_MASTER_CLASS, SNAPSHOT_CLASS, SNAPSHOT_MASTER_CLASS,
};

/// Latest master timestamp ≤ `end` for every node that has one.
async fn masters<S: DurableStore>(
    store: &S,
    class: &str,
    end: i64,
) -> Result<Vec<(String, i64)>> {
    let found = store
        .fetch(&FetchQuery::new(class, Labels::new(), i64::MIN, end).last(1))
        .await
        .with_context(|| format!("reading {class}"))?;
    Ok(found
        .into_iter()
        .filter_map(|dp| dp.node().map(|node| (node.to_string(), dp.timestamp)))
        .collect())
}

async fn sum_records<S: DurableStore>(store: &S, query: &FetchQuery) -> Result<Record> {
    let mut total = Record::default();
    for dp in store
        .fetch(query)
        .await
        .with_context(|| format!("reading {}", query.class))?
    {
        total.merge(&dp.to_record()?);
    }
    Ok(total)
}

/// Signed usage for one resource at time `at`, summed across nodes.
pub async fn metrics_at<S: DurableStore>(
    store: &S,
    level: Level,
    resource: &str,
    at: i64,
) -> Result<Record> {
    let snapshot_passes = masters(store, SNAPSHOT_MASTER_CLASS, at).await?;

    let mut nodes: BTreeSet<String> = snapshot_passes.iter().map(|(n, _)| n.clone()).collect();
    for class in [CHECKPOINT_MASTER_CLASS, CORRECTION_MASTER_CLASS] {
        nodes.extend(masters(store, class, at).await?.into_iter().map(|(n, _)| n));
    }

    let mut total = Record::default();
    for node in &nodes {
        let labels = series_labels(node, level.label(), resource);
        let boundary = snapshot_passes
            .iter()
            .find(|(n, _)| n == node)
            .map(|(_, ts)| *ts);

        if let Some(b) = boundary {
            let snapshot = FetchQuery::new(SNAPSHOT_CLASS, labels.clone(), i64::MIN, b).last(1);
            total.merge(&sum_records(store, &snapshot).await?);
        }

        let start = boundary.unwrap_or(i64::MIN);
        for class in [CHECKPOINT_CLASS, CORRECTION_CLASS] {
            let query = FetchQuery::new(class, labels.clone(), start, at);
            total.merge(&sum_records(store, &query).await?);
        }
    }

    debug!(level = level.label(), resource, at, nodes = nodes.len(), "computed metrics");
    Ok(total)
}

/// Usage for one resource at `at`, ready for display.
pub async fn list_metrics<S: DurableStore>(
    store: &S,
    level: Level,
    resource: &str,
    at: i64,
) -> Result<Record> {
    Ok(metrics_at(store, level, resource, at).await?.clamped())
}

/// Bytes stored by `account`.
///
/// Served from the cache counter while its base is fresh. Otherwise the
/// durable aggregate becomes the new base and the counter restarts from zero.
pub async fn storage_utilized<B, S>(
    cache: &ShardCache<B>,
    store: &S,
    account: &str,
    now: i64,
) -> Result<i64>
where
    B: CacheBackend,
    S: DurableStore,
{
    let counter = cache
        .fetch_account_size_counter(account)
        .await
        .context("reading account size counter")?;

    if let Some(size) = counter.current() {
        return Ok(size.max(0));
    }

    let record = metrics_at(store, Level::Account, account, now).await?;
    cache
        .update_account_counter_base(account, record.size_delta)
        .await
        .context("updating account counter base")?;

    Ok(record.size_delta.max(0))
}
