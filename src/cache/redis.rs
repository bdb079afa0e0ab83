use anyhow::{Context, Result};
use redis::AsyncCommands;
use tracing::warn;

use super::{CacheBackend, SizeCounter};
use crate::backend::redis::RedisConnector;
use crate::backend::ResilientClient;
use crate::model::Event;

/// Drops a shard and every event it references in one server-side step.
/// KEYS: shard set, shard index. ARGV: event key prefix, shard id.
const DELETE_SHARD: &str = r"
local members = redis.call('SMEMBERS', KEYS[1])
for _, uuid in ipairs(members) do
    redis.call('DEL', ARGV[1] .. uuid)
end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[2])
return #members
";

/// Drops the listed events from a shard, and the shard once it is empty.
/// KEYS: shard set, shard index. ARGV: event key prefix, shard id, uuids...
const REMOVE_EVENTS: &str = r"
for i = 3, #ARGV do
    if redis.call('SREM', KEYS[1], ARGV[i]) == 1 then
        redis.call('DEL', ARGV[1] .. ARGV[i])
    end
end
local left = redis.call('SCARD', KEYS[1])
if left == 0 then
    redis.call('SREM', KEYS[2], ARGV[2])
end
return left
";

/// Redis-backed shard cache shared by every node.
///
/// Layout, with `p` the key prefix:
///
/// - `p:shards` set of shard ids with buffered events
/// - `p:shard:{id}` set of event uuids in the shard
/// - `p:events:{uuid}` JSON event body
/// - `p:counters:{account}:size` running size delta
/// - `p:counters:{account}:base` absolute size, expiring after the base TTL
pub struct RedisBackend {
    client: ResilientClient<RedisConnector>,
    prefix: String,
    base_ttl_secs: u64,
    delete_shard: redis::Script,
    remove_events: redis::Script,
}

impl RedisBackend {
    pub fn new(client: ResilientClient<RedisConnector>, prefix: &str, base_ttl_secs: u64) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
            base_ttl_secs: base_ttl_secs.max(1),
            delete_shard: redis::Script::new(DELETE_SHARD),
            remove_events: redis::Script::new(REMOVE_EVENTS),
        }
    }

    pub fn client(&self) -> &ResilientClient<RedisConnector> {
        &self.client
    }

    fn shards_key(&self) -> String {
        format!("{}:shards", self.prefix)
    }

    fn shard_key(&self, shard: i64) -> String {
        format!("{}:shard:{shard}", self.prefix)
    }

    fn event_key(&self, uuid: &str) -> String {
        format!("{}:events:{uuid}", self.prefix)
    }

    fn event_prefix(&self) -> String {
        format!("{}:events:", self.prefix)
    }

    fn size_key(&self, account: &str) -> String {
        format!("{}:counters:{account}:size", self.prefix)
    }

    fn base_key(&self, account: &str) -> String {
        format!("{}:counters:{account}:base", self.prefix)
    }
}

impl CacheBackend for RedisBackend {
    async fn add_to_shard(&self, shard: i64, event: &Event) -> Result<()> {
        let body = serde_json::to_string(event).context("encoding event")?;
        let event_key = self.event_key(&event.uuid);
        let shard_key = self.shard_key(shard);
        let shards_key = self.shards_key();
        let uuid = event.uuid.clone();

        self.client
            .call(|mut conn| async move {
                let _: () = redis::pipe()
                    .atomic()
                    .set(&event_key, body)
                    .ignore()
                    .sadd(&shard_key, &uuid)
                    .ignore()
                    .sadd(&shards_key, shard)
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .context("adding event to shard")?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn update_counters(&self, event: &Event) -> Result<()> {
        let Some(account) = event.account.as_deref().filter(|a| !a.is_empty()) else {
            return Ok(());
        };
        let key = self.size_key(account);
        let delta = event.size_delta();

        self.client
            .call(|mut conn| async move {
                let _: i64 = conn
                    .incr(&key, delta)
                    .await
                    .context("incrementing size counter")?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_metrics(&self, shard: i64) -> Result<Vec<Event>> {
        let shard_key = self.shard_key(shard);
        let prefix = self.prefix.clone();

        let bodies: Vec<Option<String>> = self
            .client
            .call(|mut conn| async move {
                let members: Vec<String> = conn
                    .smembers(&shard_key)
                    .await
                    .context("listing shard members")?;
                if members.is_empty() {
                    return Ok(Vec::new());
                }

                let keys: Vec<String> = members
                    .iter()
                    .map(|uuid| format!("{prefix}:events:{uuid}"))
                    .collect();
                let bodies: Vec<Option<String>> = redis::cmd("MGET")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .context("reading event bodies")?;
                Ok(bodies)
            })
            .await?;

        let mut events = Vec::with_capacity(bodies.len());
        for body in bodies.into_iter().flatten() {
            match serde_json::from_str::<Event>(&body) {
                Ok(event) => events.push(event),
                Err(e) => warn!(shard, error = %e, "skipping undecodable cached event"),
            }
        }
        Ok(events)
    }

    async fn shard_exists(&self, shard: i64) -> Result<bool> {
        let shards_key = self.shards_key();
        let exists = self
            .client
            .call(|mut conn| async move {
                let exists: bool = conn
                    .sismember(&shards_key, shard)
                    .await
                    .context("checking shard index")?;
                Ok(exists)
            })
            .await?;
        Ok(exists)
    }

    async fn get_shards(&self) -> Result<Vec<i64>> {
        let shards_key = self.shards_key();
        let shards = self
            .client
            .call(|mut conn| async move {
                let shards: Vec<i64> = conn
                    .smembers(&shards_key)
                    .await
                    .context("listing shards")?;
                Ok(shards)
            })
            .await?;
        Ok(shards)
    }

    async fn delete_shard(&self, shard: i64) -> Result<()> {
        let shard_key = self.shard_key(shard);
        let shards_key = self.shards_key();
        let prefix = self.event_prefix();
        let script = self.delete_shard.clone();

        self.client
            .call(|mut conn| async move {
                let _: i64 = script
                    .key(&shard_key)
                    .key(&shards_key)
                    .arg(&prefix)
                    .arg(shard)
                    .invoke_async(&mut conn)
                    .await
                    .context("deleting shard")?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn remove_events(&self, shard: i64, uuids: &[String]) -> Result<usize> {
        let shard_key = self.shard_key(shard);
        let shards_key = self.shards_key();
        let prefix = self.event_prefix();
        let script = self.remove_events.clone();
        let uuids = uuids.to_vec();

        let left = self
            .client
            .call(|mut conn| async move {
                let left: usize = script
                    .key(&shard_key)
                    .key(&shards_key)
                    .arg(&prefix)
                    .arg(shard)
                    .arg(&uuids)
                    .invoke_async(&mut conn)
                    .await
                    .context("removing ingested events")?;
                Ok(left)
            })
            .await?;
        Ok(left)
    }

    async fn fetch_account_size_counter(&self, account: &str) -> Result<SizeCounter> {
        let keys = [self.size_key(account), self.base_key(account)];

        let (counter, base) = self
            .client
            .call(|mut conn| async move {
                let values: (Option<i64>, Option<i64>) = redis::cmd("MGET")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .context("reading account counter")?;
                Ok(values)
            })
            .await?;

        Ok(SizeCounter {
            counter: counter.unwrap_or(0),
            base,
        })
    }

    async fn update_account_counter_base(&self, account: &str, size: i64) -> Result<()> {
        let size_key = self.size_key(account);
        let base_key = self.base_key(account);
        let ttl = self.base_ttl_secs;

        self.client
            .call(|mut conn| async move {
                let _: () = redis::pipe()
                    .atomic()
                    .set(&size_key, 0)
                    .ignore()
                    .set_ex(&base_key, size, ttl)
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .context("setting account counter base")?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
