//! Process wiring: every component is built once from the config and handed
//! to the tasks and servers that need it.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info};

use crate::api::ApiServer;
use crate::backend::redis::RedisConnector;
use crate::backend::ResilientClient;
use crate::cache::{Backend, MemoryBackend, RedisBackend, ShardCache};
use crate::config::{
    CacheBackendKind, CacheConfig, Config, DiskUsageConfig, ManualOverride, StoreBackendKind,
    StoreConfig, TaskConfig,
};
use crate::health::HealthMetrics;
use crate::store::{HttpStore, MemoryStore, Store};
use crate::tasks::checkpoint::{self, CheckpointTask};
use crate::tasks::disk_usage::DiskUsageTask;
use crate::tasks::ingest::IngestShardTask;
use crate::tasks::repair::RepairTask;
use crate::tasks::snapshot::SnapshotTask;
use crate::tasks::{Schedule, Task, TaskRunner};

/// Names accepted by [`Daemon::run_task`].
pub const TASK_NAMES: [&str; 5] = ["ingest", "checkpoint", "snapshot", "repair", "disk_usage"];

#[derive(Default)]
struct Runners {
    ingest: Option<TaskRunner<IngestShardTask<Backend, Store>>>,
    checkpoint: Option<TaskRunner<CheckpointTask<Store>>>,
    snapshot: Option<TaskRunner<SnapshotTask<Store>>>,
    repair: Option<TaskRunner<RepairTask<Store>>>,
    disk_usage: Option<TaskRunner<DiskUsageTask<Store>>>,
}

/// The metering daemon: ingestion API, health server and background tasks.
pub struct Daemon {
    cfg: Config,
    health: Arc<HealthMetrics>,
    cache: Arc<ShardCache<Backend>>,
    store: Arc<Store>,
    redis: Option<ResilientClient<RedisConnector>>,
    api: ApiServer<Backend, Store>,
    runners: Runners,
}

impl Daemon {
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let store = Arc::new(build_store(&cfg.store)?);
        let (backend, redis) = build_cache_backend(&cfg.cache, &health);
        let cache = Arc::new(ShardCache::new(backend, cfg.cache.shard_width));
        let api = ApiServer::new(&cfg.listen_addr, Arc::clone(&cache), Arc::clone(&store));

        Ok(Self {
            cfg,
            health,
            cache,
            store,
            redis,
            api,
            runners: Runners::default(),
        })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Start servers, the backend probe and every enabled task.
    pub async fn start(&mut self) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        if let Some(redis) = &self.redis {
            redis.start();
        }

        let addr = self.api.start().await.context("starting ingestion api")?;
        info!(addr = %addr, node = %self.cfg.node_id, "ingestion api listening");

        let tasks = &self.cfg.tasks;
        if tasks.ingest.enabled {
            let runner = self.runner(self.ingest_task(), &tasks.ingest, tasks.ingest.schedule);
            start_runner(&runner).await?;
            self.runners.ingest = Some(runner);
        }
        if tasks.checkpoint.enabled {
            let runner = self.runner(self.checkpoint_task(), &tasks.checkpoint, tasks.checkpoint.schedule);
            start_runner(&runner).await?;
            self.runners.checkpoint = Some(runner);
        }
        if tasks.snapshot.enabled {
            let runner = self.runner(self.snapshot_task(), &tasks.snapshot, tasks.snapshot.schedule);
            start_runner(&runner).await?;
            self.runners.snapshot = Some(runner);
        }
        if tasks.repair.enabled {
            let runner = self.runner(self.repair_task(), &tasks.repair, tasks.repair.schedule);
            start_runner(&runner).await?;
            self.runners.repair = Some(runner);
        }
        if tasks.disk_usage.enabled {
            let task = self.disk_usage_task(self.cfg.disk_usage.manual)?;
            let runner = self.runner(task, &tasks.disk_usage, tasks.disk_usage.schedule);
            start_runner(&runner).await?;
            self.runners.disk_usage = Some(runner);
        }

        Ok(())
    }

    /// Stop scheduling, wait for in-flight runs, then stop the servers.
    pub async fn stop(&mut self) -> Result<()> {
        let runners = std::mem::take(&mut self.runners);
        join_runner(runners.ingest).await;
        join_runner(runners.checkpoint).await;
        join_runner(runners.snapshot).await;
        join_runner(runners.repair).await;
        join_runner(runners.disk_usage).await;

        self.api.stop().await?;

        if let Some(redis) = &self.redis {
            redis.stop().await;
        }

        self.health.stop().await?;
        Ok(())
    }

    /// Run one task a single time at its current watermark.
    ///
    /// `manual` replaces the configured lock override for `disk_usage`.
    pub async fn run_task(&self, name: &str, manual: Option<ManualOverride>) -> Result<()> {
        if let Some(redis) = &self.redis {
            redis.start();
        }

        let tasks = &self.cfg.tasks;
        let ok = match name {
            "ingest" => run_now(self.runner(self.ingest_task(), &tasks.ingest, Schedule::Now)).await?,
            "checkpoint" => {
                run_now(self.runner(self.checkpoint_task(), &tasks.checkpoint, Schedule::Now)).await?
            }
            "snapshot" => {
                run_now(self.runner(self.snapshot_task(), &tasks.snapshot, Schedule::Now)).await?
            }
            "repair" => run_now(self.runner(self.repair_task(), &tasks.repair, Schedule::Now)).await?,
            "disk_usage" => {
                let manual = manual.or(self.cfg.disk_usage.manual);
                let task = self.disk_usage_task(manual)?;
                run_now(self.runner(task, &tasks.disk_usage, Schedule::Now)).await?
            }
            other => bail!("unknown task {other:?}, expected one of {}", TASK_NAMES.join(", ")),
        };

        if let Some(redis) = &self.redis {
            redis.stop().await;
        }

        if !ok {
            bail!("task {name} failed");
        }
        Ok(())
    }

    fn runner<T: Task>(&self, task: T, tc: &TaskConfig, schedule: Schedule) -> TaskRunner<T> {
        TaskRunner::new(task, schedule, tc.lag).with_metrics(Arc::clone(&self.health))
    }

    fn ingest_task(&self) -> IngestShardTask<Backend, Store> {
        let checkpoint_lag = self.cfg.tasks.checkpoint.lag.unwrap_or(checkpoint::DEFAULT_LAG);
        IngestShardTask::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.store),
            &self.cfg.node_id,
            checkpoint_lag,
        )
        .with_metrics(Arc::clone(&self.health))
    }

    fn checkpoint_task(&self) -> CheckpointTask<Store> {
        CheckpointTask::new(Arc::clone(&self.store), &self.cfg.node_id)
            .with_metrics(Arc::clone(&self.health))
    }

    fn snapshot_task(&self) -> SnapshotTask<Store> {
        SnapshotTask::new(Arc::clone(&self.store), &self.cfg.node_id)
            .with_metrics(Arc::clone(&self.health))
    }

    fn repair_task(&self) -> RepairTask<Store> {
        RepairTask::new(Arc::clone(&self.store), &self.cfg.node_id)
            .with_metrics(Arc::clone(&self.health))
    }

    fn disk_usage_task(&self, manual: Option<ManualOverride>) -> Result<DiskUsageTask<Store>> {
        let cfg = DiskUsageConfig {
            manual,
            ..self.cfg.disk_usage.clone()
        };
        Ok(DiskUsageTask::new(Arc::clone(&self.store), &cfg)
            .context("creating disk usage task")?
            .with_metrics(Arc::clone(&self.health)))
    }
}

fn build_store(cfg: &StoreConfig) -> Result<Store> {
    Ok(match cfg.backend {
        StoreBackendKind::Memory => Store::Memory(MemoryStore::new()),
        StoreBackendKind::Http => Store::Http(HttpStore::new(cfg).context("creating http store")?),
    })
}

fn build_cache_backend(
    cfg: &CacheConfig,
    health: &Arc<HealthMetrics>,
) -> (Backend, Option<ResilientClient<RedisConnector>>) {
    match cfg.backend {
        CacheBackendKind::Memory => (Backend::Memory(MemoryBackend::new(cfg.counter_base_ttl)), None),
        CacheBackendKind::Redis => {
            let client = RedisConnector::client(cfg.redis.clone()).with_metrics(Arc::clone(health));
            let backend = RedisBackend::new(
                client.clone(),
                &cfg.redis.key_prefix,
                cfg.counter_base_ttl.as_secs().max(1),
            );
            (Backend::Redis(backend), Some(client))
        }
    }
}

async fn start_runner<T: Task>(runner: &TaskRunner<T>) -> Result<()> {
    let name = runner.task().name();
    runner
        .setup()
        .await
        .with_context(|| format!("setting up task {name}"))?;
    runner
        .start()
        .await
        .with_context(|| format!("starting task {name}"))
}

async fn run_now<T: Task>(runner: TaskRunner<T>) -> Result<bool> {
    runner.setup().await?;
    let ok = runner.run_once().await;
    runner.join().await?;
    Ok(ok)
}

async fn join_runner<T: Task>(runner: Option<TaskRunner<T>>) {
    let Some(runner) = runner else { return };
    if let Err(e) = runner.join().await {
        error!(task = runner.task().name(), error = %e, "stopping task");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> Config {
        Config {
            node_id: "n1".to_string(),
            listen_addr: "127.0.0.1:0".to_string(),
            health: crate::config::HealthConfig {
                addr: "127.0.0.1:0".to_string(),
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_run_task_rejects_unknown_name() {
        let daemon = Daemon::new(memory_config()).expect("daemon");
        let err = daemon.run_task("vacuum", None).await.unwrap_err();
        assert!(err.to_string().contains("unknown task"));
    }

    #[tokio::test]
    async fn test_run_checkpoint_once_on_empty_store() {
        let daemon = Daemon::new(memory_config()).expect("daemon");
        daemon.run_task("checkpoint", None).await.expect("checkpoint");
    }

    #[tokio::test]
    async fn test_manual_lock_via_run_task() {
        let daemon = Daemon::new(memory_config()).expect("daemon");
        daemon
            .run_task("disk_usage", Some(ManualOverride::Lock))
            .await
            .expect("lock");
        let Store::Memory(store) = daemon.store.as_ref() else {
            panic!("expected memory store");
        };
        assert!(store.is_locked());
    }

    #[tokio::test]
    async fn test_start_stop_with_tasks_disabled() {
        let mut cfg = memory_config();
        cfg.tasks.ingest.enabled = false;
        cfg.tasks.checkpoint.enabled = false;
        cfg.tasks.snapshot.enabled = false;
        cfg.tasks.repair.enabled = false;
        cfg.tasks.disk_usage.enabled = false;

        let mut daemon = Daemon::new(cfg).expect("daemon");
        daemon.start().await.expect("start");
        daemon.stop().await.expect("stop");
    }
}
