use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{CacheBackend, SizeCounter};
use crate::model::Event;

/// Process-local cache backend.
///
/// Shard membership and event bodies live behind one lock so adding and
/// deleting a shard are atomic with respect to each other.
pub struct MemoryBackend {
    shards: Mutex<ShardState>,
    counters: DashMap<String, AccountCounter>,
    base_ttl: Duration,
}

#[derive(Default)]
struct ShardState {
    events: HashMap<String, Event>,
    members: BTreeMap<i64, BTreeSet<String>>,
}

#[derive(Default)]
struct AccountCounter {
    counter: i64,
    base: Option<(i64, Instant)>,
}

impl MemoryBackend {
    pub fn new(base_ttl: Duration) -> Self {
        Self {
            shards: Mutex::new(ShardState::default()),
            counters: DashMap::new(),
            base_ttl,
        }
    }

    /// Number of event bodies held, including ones shared between shards.
    pub fn event_count(&self) -> usize {
        self.shards.lock().events.len()
    }
}

impl CacheBackend for MemoryBackend {
    async fn add_to_shard(&self, shard: i64, event: &Event) -> Result<()> {
        let mut state = self.shards.lock();
        state.events.insert(event.uuid.clone(), event.clone());
        state
            .members
            .entry(shard)
            .or_default()
            .insert(event.uuid.clone());
        Ok(())
    }

    async fn update_counters(&self, event: &Event) -> Result<()> {
        let Some(account) = event.account.as_deref().filter(|a| !a.is_empty()) else {
            return Ok(());
        };
        self.counters.entry(account.to_string()).or_default().counter += event.size_delta();
        Ok(())
    }

    async fn get_metrics(&self, shard: i64) -> Result<Vec<Event>> {
        let state = self.shards.lock();
        let Some(members) = state.members.get(&shard) else {
            return Ok(Vec::new());
        };
        Ok(members
            .iter()
            .filter_map(|uuid| state.events.get(uuid).cloned())
            .collect())
    }

    async fn shard_exists(&self, shard: i64) -> Result<bool> {
        Ok(self.shards.lock().members.contains_key(&shard))
    }

    async fn get_shards(&self) -> Result<Vec<i64>> {
        Ok(self.shards.lock().members.keys().copied().collect())
    }

    async fn delete_shard(&self, shard: i64) -> Result<()> {
        let mut state = self.shards.lock();
        if let Some(members) = state.members.remove(&shard) {
            for uuid in members {
                state.events.remove(&uuid);
            }
        }
        Ok(())
    }

    async fn remove_events(&self, shard: i64, uuids: &[String]) -> Result<usize> {
        let mut state = self.shards.lock();
        let ShardState { events, members } = &mut *state;
        let Some(set) = members.get_mut(&shard) else {
            return Ok(0);
        };
        for uuid in uuids {
            if set.remove(uuid) {
                events.remove(uuid);
            }
        }
        let left = set.len();
        if left == 0 {
            members.remove(&shard);
        }
        Ok(left)
    }

    async fn fetch_account_size_counter(&self, account: &str) -> Result<SizeCounter> {
        let Some(entry) = self.counters.get(account) else {
            return Ok(SizeCounter::default());
        };

        let base = entry
            .base
            .filter(|(_, set_at)| set_at.elapsed() < self.base_ttl)
            .map(|(size, _)| size);

        Ok(SizeCounter {
            counter: entry.counter,
            base,
        })
    }

    async fn update_account_counter_base(&self, account: &str, size: i64) -> Result<()> {
        let mut entry = self.counters.entry(account.to_string()).or_default();
        entry.counter = 0;
        entry.base = Some((size, Instant::now()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OperationId;

    fn event(uuid: &str, size: i64) -> Event {
        let mut e = Event::new(OperationId::PutObject);
        e.uuid = uuid.to_string();
        e.timestamp = 1_700_000_000_000_000;
        e.account = Some("a1".to_string());
        e.size_delta = Some(size);
        e
    }

    #[tokio::test]
    async fn test_remove_events_keeps_later_arrivals() {
        let backend = MemoryBackend::new(Duration::from_secs(60));
        backend.add_to_shard(10, &event("a", 1)).await.expect("add");
        let read: Vec<String> = backend
            .get_metrics(10)
            .await
            .expect("metrics")
            .into_iter()
            .map(|e| e.uuid)
            .collect();

        // Arrives after the shard was read.
        backend.add_to_shard(10, &event("b", 1)).await.expect("add");

        assert_eq!(backend.remove_events(10, &read).await.expect("remove"), 1);
        assert!(backend.shard_exists(10).await.expect("exists"));
        let left = backend.get_metrics(10).await.expect("metrics");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].uuid, "b");

        assert_eq!(
            backend.remove_events(10, &["b".to_string()]).await.expect("remove"),
            0
        );
        assert!(!backend.shard_exists(10).await.expect("exists"));
        assert_eq!(backend.event_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_shard_removes_bodies() {
        let backend = MemoryBackend::new(Duration::from_secs(60));
        backend.add_to_shard(10, &event("a", 1)).await.expect("add");
        backend.add_to_shard(10, &event("b", 1)).await.expect("add");
        backend.add_to_shard(20, &event("c", 1)).await.expect("add");
        assert_eq!(backend.event_count(), 3);

        backend.delete_shard(10).await.expect("delete");
        assert!(!backend.shard_exists(10).await.expect("exists"));
        assert!(backend.shard_exists(20).await.expect("exists"));
        assert_eq!(backend.event_count(), 1);
        assert!(backend.get_metrics(10).await.expect("metrics").is_empty());

        // Deleting again is a no-op.
        backend.delete_shard(10).await.expect("delete twice");
    }

    #[tokio::test]
    async fn test_same_uuid_stored_once() {
        let backend = MemoryBackend::new(Duration::from_secs(60));
        backend.add_to_shard(10, &event("a", 1)).await.expect("add");
        backend.add_to_shard(10, &event("a", 5)).await.expect("add");

        let events = backend.get_metrics(10).await.expect("metrics");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].size_delta, Some(5));
    }

    #[tokio::test]
    async fn test_counter_ignores_missing_account() {
        let backend = MemoryBackend::new(Duration::from_secs(60));
        let mut e = event("a", 10);
        e.account = None;
        backend.update_counters(&e).await.expect("update");
        assert!(backend.counters.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_base_expires_after_ttl() {
        let backend = MemoryBackend::new(Duration::from_secs(60));
        backend
            .update_account_counter_base("a1", 1000)
            .await
            .expect("base");
        backend.update_counters(&event("a", 25)).await.expect("update");

        let c = backend.fetch_account_size_counter("a1").await.expect("fetch");
        assert_eq!(c.current(), Some(1025));

        tokio::time::advance(Duration::from_secs(61)).await;
        let c = backend.fetch_account_size_counter("a1").await.expect("fetch");
        assert_eq!(c, SizeCounter { counter: 25, base: None });
    }
}
