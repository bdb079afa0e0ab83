//! Time-sharded buffer of events waiting for durable ingestion, plus the
//! per-account running size counter.

pub mod memory;
pub mod redis;

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, warn};

use crate::model::{shard_from_timestamp, Event};

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Account size counter: signed deltas applied since `base` was read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeCounter {
    pub counter: i64,
    /// Absolute size at the time the base was set, or None once it expired.
    pub base: Option<i64>,
}

impl SizeCounter {
    /// Current size when the base is known.
    pub fn current(&self) -> Option<i64> {
        self.base.map(|base| base + self.counter)
    }
}

/// Storage primitives behind a [`ShardCache`].
///
/// Each mutating operation is one atomic backend transaction.
pub trait CacheBackend: Send + Sync + 'static {
    /// Store the event under its uuid and add the key to the shard's member set.
    fn add_to_shard(&self, shard: i64, event: &Event) -> impl Future<Output = Result<()>> + Send;

    /// Apply the event's size delta to its account counter.
    fn update_counters(&self, event: &Event) -> impl Future<Output = Result<()>> + Send;

    /// Events currently buffered in a shard.
    fn get_metrics(&self, shard: i64) -> impl Future<Output = Result<Vec<Event>>> + Send;

    fn shard_exists(&self, shard: i64) -> impl Future<Output = Result<bool>> + Send;

    /// Every shard with buffered events.
    fn get_shards(&self) -> impl Future<Output = Result<Vec<i64>>> + Send;

    /// Remove the shard's member set and every event it references.
    fn delete_shard(&self, shard: i64) -> impl Future<Output = Result<()>> + Send;

    /// Remove the given events from a shard, dropping the shard once it is
    /// empty. Members added after the events were read stay buffered.
    /// Returns how many members remain.
    fn remove_events(
        &self,
        shard: i64,
        uuids: &[String],
    ) -> impl Future<Output = Result<usize>> + Send;

    fn fetch_account_size_counter(
        &self,
        account: &str,
    ) -> impl Future<Output = Result<SizeCounter>> + Send;

    /// Reset the counter to zero and set a fresh base that expires after the TTL.
    fn update_account_counter_base(
        &self,
        account: &str,
        size: i64,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Cache backend selected at startup.
pub enum Backend {
    Memory(MemoryBackend),
    Redis(RedisBackend),
}

impl CacheBackend for Backend {
    async fn add_to_shard(&self, shard: i64, event: &Event) -> Result<()> {
        match self {
            Self::Memory(b) => b.add_to_shard(shard, event).await,
            Self::Redis(b) => b.add_to_shard(shard, event).await,
        }
    }

    async fn update_counters(&self, event: &Event) -> Result<()> {
        match self {
            Self::Memory(b) => b.update_counters(event).await,
            Self::Redis(b) => b.update_counters(event).await,
        }
    }

    async fn get_metrics(&self, shard: i64) -> Result<Vec<Event>> {
        match self {
            Self::Memory(b) => b.get_metrics(shard).await,
            Self::Redis(b) => b.get_metrics(shard).await,
        }
    }

    async fn shard_exists(&self, shard: i64) -> Result<bool> {
        match self {
            Self::Memory(b) => b.shard_exists(shard).await,
            Self::Redis(b) => b.shard_exists(shard).await,
        }
    }

    async fn get_shards(&self) -> Result<Vec<i64>> {
        match self {
            Self::Memory(b) => b.get_shards().await,
            Self::Redis(b) => b.get_shards().await,
        }
    }

    async fn delete_shard(&self, shard: i64) -> Result<()> {
        match self {
            Self::Memory(b) => b.delete_shard(shard).await,
            Self::Redis(b) => b.delete_shard(shard).await,
        }
    }

    async fn remove_events(&self, shard: i64, uuids: &[String]) -> Result<usize> {
        match self {
            Self::Memory(b) => b.remove_events(shard, uuids).await,
            Self::Redis(b) => b.remove_events(shard, uuids).await,
        }
    }

    async fn fetch_account_size_counter(&self, account: &str) -> Result<SizeCounter> {
        match self {
            Self::Memory(b) => b.fetch_account_size_counter(account).await,
            Self::Redis(b) => b.fetch_account_size_counter(account).await,
        }
    }

    async fn update_account_counter_base(&self, account: &str, size: i64) -> Result<()> {
        match self {
            Self::Memory(b) => b.update_account_counter_base(account, size).await,
            Self::Redis(b) => b.update_account_counter_base(account, size).await,
        }
    }
}

/// Entry point for producers and the ingestion task.
pub struct ShardCache<B> {
    backend: B,
    shard_width: Duration,
}

impl<B: CacheBackend> ShardCache<B> {
    pub fn new(backend: B, shard_width: Duration) -> Self {
        Self {
            backend,
            shard_width,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn shard_width(&self) -> Duration {
        self.shard_width
    }

    /// Shard an event belongs to.
    pub fn shard_for(&self, ts_us: i64) -> i64 {
        shard_from_timestamp(ts_us, self.shard_width)
    }

    /// Buffer one event and apply its size delta to the account counter.
    ///
    /// Returns false, without touching the counter, when the event could not
    /// be stored. Once stored, the counter update is best effort: a retried
    /// push would overwrite the event but apply the delta twice, so callers
    /// must not retry a push that returned true.
    pub async fn push_metric(&self, event: &Event) -> bool {
        let shard = self.shard_for(event.timestamp);

        if let Err(e) = self.backend.add_to_shard(shard, event).await {
            error!(shard, uuid = %event.uuid, error = %e, "failed to add event to shard");
            return false;
        }

        if let Err(e) = self.backend.update_counters(event).await {
            warn!(uuid = %event.uuid, error = %e, "failed to update account counter");
        }

        true
    }

    pub async fn get_metrics_for_shard(&self, shard: i64) -> Result<Vec<Event>> {
        self.backend.get_metrics(shard).await
    }

    pub async fn shard_exists(&self, shard: i64) -> Result<bool> {
        self.backend.shard_exists(shard).await
    }

    /// Every shard with buffered events, ascending.
    pub async fn get_shards(&self) -> Result<Vec<i64>> {
        let mut shards = self.backend.get_shards().await?;
        shards.sort_unstable();
        Ok(shards)
    }

    pub async fn delete_shard(&self, shard: i64) -> Result<()> {
        self.backend.delete_shard(shard).await
    }

    /// Drop events that were ingested from `shard`; returns members left.
    pub async fn remove_events(&self, shard: i64, uuids: &[String]) -> Result<usize> {
        self.backend.remove_events(shard, uuids).await
    }

    pub async fn fetch_account_size_counter(&self, account: &str) -> Result<SizeCounter> {
        self.backend.fetch_account_size_counter(account).await
    }

    pub async fn update_account_counter_base(&self, account: &str, size: i64) -> Result<()> {
        self.backend.update_account_counter_base(account, size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OperationId;

    fn event(uuid: &str, ts: i64, account: &str, size: i64) -> Event {
        let mut e = Event::new(OperationId::PutObject);
        e.uuid = uuid.to_string();
        e.timestamp = ts;
        e.account = Some(account.to_string());
        e.size_delta = Some(size);
        e
    }

    fn cache() -> ShardCache<Backend> {
        ShardCache::new(
            Backend::Memory(MemoryBackend::new(Duration::from_secs(86400))),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn test_push_shards_by_width() {
        let cache = cache();
        assert!(cache.push_metric(&event("a", 1_000_001_000_000, "a1", 10)).await);
        assert!(cache.push_metric(&event("b", 1_000_009_999_999, "a1", 10)).await);
        assert!(cache.push_metric(&event("c", 1_000_010_000_000, "a1", 10)).await);

        let shards = cache.get_shards().await.expect("shards");
        assert_eq!(shards, vec![1_000_000_000_000, 1_000_010_000_000]);

        let first = cache
            .get_metrics_for_shard(1_000_000_000_000)
            .await
            .expect("metrics");
        assert_eq!(first.len(), 2);
    }

    #[tokio::test]
    async fn test_counter_applied_once_per_push() {
        let cache = cache();
        assert!(cache.push_metric(&event("a", 1_000_000_000_000, "a1", 100)).await);
        assert!(cache.push_metric(&event("b", 1_000_000_000_001, "a1", -40)).await);

        let counter = cache
            .fetch_account_size_counter("a1")
            .await
            .expect("counter");
        assert_eq!(counter.counter, 60);
        assert_eq!(counter.base, None);
        assert_eq!(counter.current(), None);

        cache
            .update_account_counter_base("a1", 500)
            .await
            .expect("base");
        let counter = cache
            .fetch_account_size_counter("a1")
            .await
            .expect("counter");
        assert_eq!(counter, SizeCounter { counter: 0, base: Some(500) });
        assert_eq!(counter.current(), Some(500));
    }
}
