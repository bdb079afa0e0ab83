use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::Task;
use crate::config::{DiskUsageConfig, ManualOverride};
use crate::health::HealthMetrics;
use crate::model::{duration_micros, Labels};
use crate::store::{
    procedure, DeleteQuery, DurableStore, CHECKPOINT_CLASS, CORRECTION_CLASS, EVENT_CLASS,
    REPAIR_EVENT_CLASS,
};

/// Classes retention expires. Snapshots and master markers carry running
/// totals and compaction boundaries, so they are kept.
pub const EXPIRABLE_CLASSES: [&str; 4] =
    [EVENT_CLASS, REPAIR_EVENT_CLASS, CHECKPOINT_CLASS, CORRECTION_CLASS];

/// Where a measurement falls relative to the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    Normal,
    Warn,
    Action,
}

/// Watches the store's on-disk size, write-locks it when it grows past the
/// action threshold and, on the leader, expires data past retention.
pub struct DiskUsageTask<S> {
    store: Arc<S>,
    path: Option<PathBuf>,
    hard_limit: Option<u64>,
    warn_threshold: f64,
    action_threshold: f64,
    retention: Option<Duration>,
    leader: bool,
    expiration_chunk: Duration,
    manual: Option<ManualOverride>,
    /// Lock state read from the store at the start of the current run;
    /// None when the store could not say.
    locked: Mutex<Option<bool>>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<S: DurableStore> DiskUsageTask<S> {
    pub fn new(store: Arc<S>, cfg: &DiskUsageConfig) -> Result<Self> {
        let hard_limit = cfg.hard_limit_bytes()?;

        if cfg.manual.is_none() {
            if cfg.path.is_none() {
                bail!("disk_usage.path is required");
            }
            match hard_limit {
                None => bail!("disk_usage.hard_limit is required"),
                Some(0) => bail!("disk_usage.hard_limit must be positive"),
                Some(_) => {}
            }
        }

        Ok(Self {
            store,
            path: cfg.path.clone(),
            hard_limit,
            warn_threshold: cfg.warn_threshold,
            action_threshold: cfg.action_threshold,
            retention: cfg.retention,
            leader: cfg.leader,
            expiration_chunk: cfg.expiration_chunk,
            manual: cfg.manual,
            locked: Mutex::new(None),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace the configured override, e.g. from the command line.
    pub fn with_manual(mut self, manual: Option<ManualOverride>) -> Self {
        self.manual = manual;
        self
    }

    pub fn classify(&self, size: u64) -> Pressure {
        let Some(limit) = self.hard_limit.filter(|l| *l > 0) else {
            return Pressure::Normal;
        };
        let ratio = size as f64 / limit as f64;
        if ratio >= self.action_threshold {
            Pressure::Action
        } else if ratio >= self.warn_threshold {
            Pressure::Warn
        } else {
            Pressure::Normal
        }
    }

    /// Read the lock state from the store. Operators may lock or unlock it
    /// between runs, so this happens before every check.
    async fn refresh_lock_state(&self) {
        let state = match self.store.exec(procedure::LOCKED, Value::Null).await {
            Ok(Value::Bool(locked)) => Some(locked),
            Ok(other) => {
                debug!(reply = %other, "store did not report lock state");
                None
            }
            Err(e) => {
                warn!(error = %e, "reading store lock state");
                None
            }
        };
        *self.locked.lock() = state;
        if let (Some(m), Some(locked)) = (&self.metrics, state) {
            m.disk_usage_locked.set(if locked { 1.0 } else { 0.0 });
        }
    }

    async fn set_locked(&self, want: bool) -> Result<()> {
        if *self.locked.lock() == Some(want) {
            return Ok(());
        }

        let name = if want { procedure::LOCK } else { procedure::UNLOCK };
        self.store
            .exec(name, Value::Null)
            .await
            .with_context(|| format!("running store {name}"))?;

        *self.locked.lock() = Some(want);
        if let Some(m) = &self.metrics {
            m.disk_usage_locked.set(if want { 1.0 } else { 0.0 });
        }
        info!(locked = want, "store write lock changed");
        Ok(())
    }

    async fn check_usage(&self) -> Result<()> {
        let (Some(path), Some(limit)) = (&self.path, self.hard_limit) else {
            bail!("disk usage measurement needs a path and a hard limit");
        };

        let size = measure(path.clone()).await?;
        if let Some(m) = &self.metrics {
            m.disk_usage_bytes.set(size as f64);
        }

        let used = format!("{:.1}%", size as f64 * 100.0 / limit as f64);
        match self.classify(size) {
            Pressure::Action => {
                error!(
                    path = %path.display(),
                    size,
                    limit,
                    used = %used,
                    "disk usage above action threshold, locking store writes",
                );
                self.set_locked(true).await
            }
            Pressure::Warn => {
                warn!(path = %path.display(), size, limit, used = %used, "disk usage above warn threshold");
                self.set_locked(false).await
            }
            Pressure::Normal => {
                info!(path = %path.display(), size, limit, used = %used, "disk usage");
                self.set_locked(false).await
            }
        }
    }

    /// Delete expirable data older than `watermark - retention`, one chunk at a time.
    async fn expire(&self, watermark: i64) -> Result<usize> {
        let Some(retention) = self.retention else {
            return Ok(0);
        };
        let cutoff = watermark - duration_micros(retention);

        let oldest = self
            .store
            .exec(procedure::OLDEST, json!({ "classes": EXPIRABLE_CLASSES }))
            .await
            .context("finding oldest datapoint")?;
        let Some(oldest) = oldest.as_i64() else {
            debug!("nothing stored, skipping expiration");
            return Ok(0);
        };

        if oldest >= cutoff {
            debug!(oldest, cutoff, "no data past retention");
            return Ok(0);
        }

        let chunk = duration_micros(self.expiration_chunk).max(1);
        // Delete ranges are (start, end]; the last chunk ends just before the cutoff.
        let last = cutoff - 1;
        let mut start = oldest - 1;
        let mut chunks = 0;
        let mut removed = 0;

        while start < last {
            let end = start.saturating_add(chunk).min(last);
            for class in EXPIRABLE_CLASSES {
                removed += self
                    .store
                    .delete(&DeleteQuery {
                        class: Some(class.to_string()),
                        selector: Labels::new(),
                        start,
                        end,
                    })
                    .await
                    .with_context(|| format!("expiring {class} in ({start}, {end}]"))?;
            }
            chunks += 1;
            if let Some(m) = &self.metrics {
                m.expired_chunks.inc();
            }
            start = end;
        }

        info!(chunks, removed, cutoff, "expired data past retention");
        Ok(chunks)
    }
}

impl<S: DurableStore> Task for DiskUsageTask<S> {
    fn name(&self) -> &'static str {
        "disk_usage"
    }

    fn default_lag(&self) -> Duration {
        Duration::ZERO
    }

    async fn setup(&self) -> Result<()> {
        self.refresh_lock_state().await;
        Ok(())
    }

    async fn execute(&self, watermark: i64) -> Result<()> {
        self.refresh_lock_state().await;

        match self.manual {
            Some(ManualOverride::Lock) => {
                info!("manual override, locking store writes");
                self.set_locked(true).await?;
            }
            Some(ManualOverride::Unlock) => {
                info!("manual override, unlocking store writes");
                self.set_locked(false).await?;
            }
            None => self.check_usage().await?,
        }

        if self.leader {
            self.expire(watermark).await?;
        }
        Ok(())
    }
}

/// Total size of the files under `path`.
pub async fn measure(path: PathBuf) -> Result<u64> {
    let display = path.display().to_string();
    tokio::task::spawn_blocking(move || folder_size(&path))
        .await
        .context("disk usage walk panicked")?
        .with_context(|| format!("measuring {display}"))
}

fn folder_size(path: &Path) -> io::Result<u64> {
    let meta = std::fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }

    let mut total = 0u64;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        match folder_size(&entry.path()) {
            Ok(size) => total += size,
            // Files come and go while the store compacts.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{node_labels, Datapoint, MemoryStore, SNAPSHOT_CLASS};

    fn config(path: &Path) -> DiskUsageConfig {
        DiskUsageConfig {
            path: Some(path.to_path_buf()),
            hard_limit: Some("1000".to_string()),
            ..DiskUsageConfig::default()
        }
    }

    #[test]
    fn test_classify_thresholds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let task = DiskUsageTask::new(Arc::new(MemoryStore::new()), &config(dir.path()))
            .expect("task");
        assert_eq!(task.classify(799), Pressure::Normal);
        assert_eq!(task.classify(800), Pressure::Warn);
        assert_eq!(task.classify(949), Pressure::Warn);
        assert_eq!(task.classify(950), Pressure::Action);
    }

    #[test]
    fn test_requires_limit_unless_manual() {
        let mut cfg = DiskUsageConfig::default();
        let err = DiskUsageTask::new(Arc::new(MemoryStore::new()), &cfg)
            .err()
            .expect("error");
        assert!(err.to_string().contains("path"));

        cfg.manual = Some(ManualOverride::Lock);
        DiskUsageTask::new(Arc::new(MemoryStore::new()), &cfg).expect("manual task");
    }

    #[tokio::test]
    async fn test_folder_size_recurses() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a"), vec![0u8; 100]).expect("write");
        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");
        std::fs::write(dir.path().join("sub").join("b"), vec![0u8; 50]).expect("write");

        assert_eq!(measure(dir.path().to_path_buf()).await.expect("measure"), 150);
    }

    #[tokio::test]
    async fn test_manual_lock_bypasses_measurement() {
        let store = Arc::new(MemoryStore::new());
        let cfg = DiskUsageConfig {
            manual: Some(ManualOverride::Lock),
            ..DiskUsageConfig::default()
        };
        let task = DiskUsageTask::new(Arc::clone(&store), &cfg).expect("task");
        task.setup().await.expect("setup");
        task.execute(0).await.expect("execute");
        assert!(store.is_locked());

        let task = task.with_manual(Some(ManualOverride::Unlock));
        task.execute(0).await.expect("execute");
        assert!(!store.is_locked());
    }

    #[tokio::test]
    async fn test_leader_expires_in_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let minute = 60_000_000;
        let mut records = Vec::new();
        for i in 0..60 {
            records.push(Datapoint::new(EVENT_CLASS, node_labels("n1"), i * minute, json!(i)));
        }
        records.push(Datapoint::new(SNAPSHOT_CLASS, node_labels("n1"), 0, json!(0)));
        store.ingest(&records).await.expect("ingest");

        let cfg = DiskUsageConfig {
            retention: Some(Duration::from_secs(30 * 60)),
            leader: true,
            expiration_chunk: Duration::from_secs(15 * 60),
            ..config(dir.path())
        };
        let task = DiskUsageTask::new(Arc::clone(&store), &cfg).expect("task");
        task.execute(60 * minute).await.expect("execute");

        // Everything before minute 30 is gone, in two 15 minute chunks.
        assert_eq!(store.class_len(EVENT_CLASS), 30);
        assert_eq!(store.class_len(SNAPSHOT_CLASS), 1);

        let chunks = task.expire(60 * minute).await.expect("expire again");
        assert_eq!(chunks, 0);
    }
}
