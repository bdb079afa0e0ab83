use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::debug;

use super::{procedure, Datapoint, DeleteQuery, DurableStore, FetchQuery};
use crate::model::Labels;

type SeriesKey = (String, Labels);

/// In-process durable store for single-node runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    series: RwLock<BTreeMap<SeriesKey, BTreeMap<i64, Value>>>,
    locked: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Total datapoints held across every series.
    pub fn len(&self) -> usize {
        self.series.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Datapoints held for one class.
    pub fn class_len(&self, class: &str) -> usize {
        self.series
            .read()
            .iter()
            .filter(|((c, _), _)| c == class)
            .map(|(_, points)| points.len())
            .sum()
    }
}

fn matches(labels: &Labels, selector: &Labels) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|have| have == v))
}

impl DurableStore for MemoryStore {
    async fn ingest(&self, records: &[Datapoint]) -> Result<usize> {
        if self.is_locked() {
            bail!("store is locked for writes");
        }

        let mut series = self.series.write();
        for dp in records {
            series
                .entry((dp.class.clone(), dp.labels.clone()))
                .or_default()
                .insert(dp.timestamp, dp.value.clone());
        }
        Ok(records.len())
    }

    async fn fetch(&self, query: &FetchQuery) -> Result<Vec<Datapoint>> {
        if query.end <= query.start {
            return Ok(Vec::new());
        }

        let series = self.series.read();
        let mut out = Vec::new();

        for ((class, labels), points) in series.iter() {
            if class != &query.class || !matches(labels, &query.selector) {
                continue;
            }

            let window = points.range(query.start + 1..=query.end);
            let selected: Vec<(&i64, &Value)> = match query.last {
                Some(n) => {
                    let mut tail: Vec<_> = window.rev().take(n).collect();
                    tail.reverse();
                    tail
                }
                None => window.collect(),
            };

            out.extend(selected.into_iter().map(|(ts, value)| Datapoint {
                class: class.clone(),
                labels: labels.clone(),
                timestamp: *ts,
                value: value.clone(),
            }));
        }

        Ok(out)
    }

    async fn exec(&self, procedure: &str, params: Value) -> Result<Value> {
        match procedure {
            procedure::LOCK => {
                self.locked.store(true, Ordering::SeqCst);
                debug!("memory store locked");
                Ok(json!({ "locked": true }))
            }
            procedure::UNLOCK => {
                self.locked.store(false, Ordering::SeqCst);
                debug!("memory store unlocked");
                Ok(json!({ "locked": false }))
            }
            procedure::LOCKED => Ok(Value::Bool(self.is_locked())),
            procedure::OLDEST => {
                // Optional {"classes": [...]} narrows the search.
                let classes: Option<Vec<String>> = params
                    .get("classes")
                    .map(|v| serde_json::from_value(v.clone()))
                    .transpose()
                    .context("decoding oldest classes")?;
                let oldest = self
                    .series
                    .read()
                    .iter()
                    .filter(|((class, _), _)| {
                        classes.as_ref().map_or(true, |wanted| wanted.contains(class))
                    })
                    .filter_map(|(_, points)| points.keys().next().copied())
                    .min();
                Ok(oldest.map_or(Value::Null, Value::from))
            }
            other => bail!("unknown store procedure {other:?}"),
        }
    }

    async fn delete(&self, query: &DeleteQuery) -> Result<usize> {
        if query.end <= query.start {
            return Ok(0);
        }

        let mut series = self.series.write();
        let mut removed = 0;

        for ((class, labels), points) in series.iter_mut() {
            if query.class.as_ref().is_some_and(|c| c != class) {
                continue;
            }
            if !matches(labels, &query.selector) {
                continue;
            }

            let doomed: Vec<i64> = points
                .range(query.start + 1..=query.end)
                .map(|(ts, _)| *ts)
                .collect();
            for ts in doomed {
                points.remove(&ts);
                removed += 1;
            }
        }

        series.retain(|_, points| !points.is_empty());
        Ok(removed)
    }
}
