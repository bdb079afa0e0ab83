//! Producer-side client for the ingestion endpoint.
//!
//! Delivery is attempted inline. A metric that cannot be delivered is parked
//! in the retry cache and re-sent later by a delayed drain, so callers of
//! [`MeterClient::push_metric`] never see transient endpoint failures.

pub mod adjust;
pub mod retry_cache;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use reqwest::{StatusCode, Url};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::health::HealthMetrics;
use crate::model::clock::now_micros;
use crate::model::{Event, Level, StorageUsage};

pub use self::retry_cache::{Entry, RetryCache};

/// Emit a metric that is leaving the retry path without being delivered.
fn recovery_log(event: &str, reason: &'static str) {
    info!(target: "meterd::recovery", event, recovery = true, reason, "metric recovery log");
}

/// Client for pushing metrics to a meterd ingestion endpoint.
#[derive(Clone)]
pub struct MeterClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    endpoint: Url,
    /// None when the retry cache is disabled.
    cache: Option<RetryCache>,
    max_cached: usize,
    drain_delay: Duration,
    chunk_size: usize,
    /// Set while a drain is waiting or running.
    drain_scheduled: AtomicBool,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    metrics: Option<Arc<HealthMetrics>>,
}

impl MeterClient {
    pub fn new(cfg: &ClientConfig) -> Result<Self> {
        let endpoint = Url::parse(&cfg.endpoint)
            .with_context(|| format!("parsing client endpoint {:?}", cfg.endpoint))?;
        if endpoint.cannot_be_a_base() {
            bail!("client endpoint {:?} is not a base URL", cfg.endpoint);
        }

        let timeout = if cfg.request_timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.request_timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        let cache = if cfg.disable_retry_cache {
            None
        } else {
            Some(RetryCache::open(cfg.retry_cache_path.as_deref())?)
        };

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                endpoint,
                cache,
                max_cached: cfg.max_cached_metrics.max(1),
                drain_delay: cfg.drain_delay,
                chunk_size: cfg.chunk_size.max(1),
                drain_scheduled: AtomicBool::new(false),
                drain_task: Mutex::new(None),
                cancel: CancellationToken::new(),
                metrics: None,
            }),
        })
    }

    /// Attach health metrics. Must be called before the client is cloned.
    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.metrics = Some(metrics);
        }
        self
    }

    /// Deliver one metric.
    ///
    /// A missing uuid or timestamp is filled in first, so a cached retry is
    /// recognised as the same event by the server. With the retry cache
    /// enabled, delivery failures are absorbed and this only fails if the
    /// metric cannot be encoded.
    pub async fn push_metric(&self, mut event: Event) -> Result<()> {
        event.ensure_identity(now_micros());

        let err = match self.inner.send(std::slice::from_ref(&event)).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let Some(cache) = &self.inner.cache else {
            return Err(err.context("delivering metric"));
        };

        warn!(uuid = %event.uuid, error = %format!("{err:#}"), "metric delivery failed, caching for retry");
        self.inner.cache_metric(cache, &event).await?;
        Inner::schedule_drain(&self.inner);
        Ok(())
    }

    /// Storage used by one resource, as reported by the endpoint.
    pub async fn get_storage(&self, level: Level, resource: &str) -> Result<StorageUsage> {
        let url = self
            .inner
            .url(&["v2", "storage", level.service(), resource])?;

        let resp = self
            .inner
            .http
            .get(url)
            .send()
            .await
            .context("requesting storage")?;

        let status = resp.status();
        if !status.is_success() {
            bail!("storage query returned {status}");
        }

        resp.json().await.context("decoding storage reply")
    }

    /// Entries currently waiting in the retry cache.
    pub async fn cached(&self) -> Result<usize> {
        match &self.inner.cache {
            Some(cache) => cache.len().await,
            None => Ok(0),
        }
    }

    /// Whether a drain is waiting or running.
    pub fn drain_scheduled(&self) -> bool {
        self.inner.drain_scheduled.load(Ordering::SeqCst)
    }

    /// Run one drain immediately, returning the entries left afterwards.
    pub async fn drain(&self) -> Result<usize> {
        self.inner.drain().await
    }

    /// Stop draining and flush whatever is still cached to the recovery log.
    pub async fn join(&self) -> Result<()> {
        self.inner.cancel.cancel();

        // A drain finishing as we cancel may have queued a successor.
        loop {
            let handle = self.inner.drain_task.lock().take();
            let Some(handle) = handle else { break };
            if let Err(e) = handle.await {
                warn!(error = %e, "retry drain task failed");
            }
        }

        if let Some(cache) = &self.inner.cache {
            let flushed = self.inner.flush(cache).await?;
            if flushed > 0 {
                info!(flushed, "flushed retry cache on close");
            }
        }

        Ok(())
    }
}

impl Inner {
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("client endpoint is not a base URL"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, events: &[Event]) -> Result<()> {
        let url = self.url(&["v2", "ingest"])?;
        let resp = self
            .http
            .post(url)
            .json(events)
            .send()
            .await
            .context("posting metrics")?;

        let status = resp.status();
        if status != StatusCode::OK {
            bail!("ingestion endpoint returned {status}");
        }
        Ok(())
    }

    async fn healthy(&self) -> bool {
        let url = match self.url(&["_", "healthcheck"]) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "building healthcheck url");
                return false;
            }
        };

        match self.http.get(url).send().await {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(e) => {
                debug!(error = %e, "ingestion endpoint healthcheck failed");
                false
            }
        }
    }

    async fn cache_metric(&self, cache: &RetryCache, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event).context("encoding metric")?;

        match cache.put_bounded(&event.uuid, &json, self.max_cached).await {
            Ok(true) => {}
            Ok(false) => {
                recovery_log(&json, "overflow");
                if let Some(m) = &self.metrics {
                    m.retry_cache_overflow.inc();
                }
                return Ok(());
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "caching metric for retry");
                recovery_log(&json, "error");
                return Ok(());
            }
        }

        self.record_size(cache).await;
        Ok(())
    }

    async fn record_size(&self, cache: &RetryCache) {
        let Some(m) = &self.metrics else { return };
        match cache.len().await {
            Ok(n) => m.retry_cache_entries.set(n as f64),
            Err(e) => debug!(error = %e, "reading retry cache size"),
        }
    }

    /// Arm a drain after the configured delay unless one is already pending.
    fn schedule_drain(this: &Arc<Self>) {
        if this.cancel.is_cancelled() || this.cache.is_none() {
            return;
        }
        if this.drain_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(this);
        let handle = tokio::spawn(async move {
            tokio::select! {
                () = inner.cancel.cancelled() => {
                    inner.drain_scheduled.store(false, Ordering::SeqCst);
                    return;
                }
                () = tokio::time::sleep(inner.drain_delay) => {}
            }

            let remaining = match inner.drain().await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "retry cache drain failed");
                    // Unknown state; try again later.
                    1
                }
            };

            inner.drain_scheduled.store(false, Ordering::SeqCst);
            if remaining > 0 {
                Self::schedule_drain(&inner);
            }
        });

        *this.drain_task.lock() = Some(handle);
    }

    async fn drain(&self) -> Result<usize> {
        let Some(cache) = &self.cache else {
            return Ok(0);
        };

        if !self.healthy().await {
            let remaining = cache.len().await?;
            debug!(remaining, "ingestion endpoint unhealthy, deferring drain");
            return Ok(remaining);
        }

        let mut after = 0;
        let mut delivered = 0;

        while !self.cancel.is_cancelled() {
            let batch = cache.entries(after, self.chunk_size).await?;
            let Some(last) = batch.last() else { break };
            after = last.seq;

            let mut keys = Vec::with_capacity(batch.len());
            let mut events = Vec::with_capacity(batch.len());
            let mut undecodable = Vec::new();

            for entry in batch {
                match serde_json::from_str::<Event>(&entry.value) {
                    Ok(event) => {
                        keys.push(entry.key);
                        events.push(event);
                    }
                    Err(e) => {
                        warn!(key = %entry.key, error = %e, "dropping undecodable retry entry");
                        recovery_log(&entry.value, "error");
                        undecodable.push(entry.key);
                    }
                }
            }
            cache.delete(undecodable).await?;

            if events.is_empty() {
                continue;
            }

            match self.send(&events).await {
                Ok(()) => delivered += cache.delete(keys).await?,
                Err(e) => {
                    warn!(count = events.len(), error = %format!("{e:#}"), "retry chunk delivery failed");
                }
            }
        }

        let remaining = cache.len().await?;
        if let Some(m) = &self.metrics {
            m.retry_cache_entries.set(remaining as f64);
        }
        info!(delivered, remaining, "retry cache drain finished");
        Ok(remaining)
    }

    async fn flush(&self, cache: &RetryCache) -> Result<usize> {
        let mut flushed = 0;
        loop {
            let batch = cache.entries(0, self.chunk_size).await?;
            if batch.is_empty() {
                break;
            }

            let mut keys = Vec::with_capacity(batch.len());
            for entry in batch {
                recovery_log(&entry.value, "flush");
                keys.push(entry.key);
            }
            flushed += cache.delete(keys).await?;
        }

        if let Some(m) = &self.metrics {
            m.retry_cache_entries.set(0.0);
        }
        Ok(flushed)
    }
}
