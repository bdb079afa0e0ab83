pub mod checkpoint;
pub mod disk_usage;
pub mod ingest;
pub mod repair;
pub mod snapshot;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::health::HealthMetrics;
use crate::model::clock::now_micros;
use crate::model::duration_micros;

/// When a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Schedule {
    /// Run once immediately, then finish.
    Now,
    /// Run repeatedly, one interval after the previous run was due.
    Every(Duration),
}

impl TryFrom<String> for Schedule {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("now") {
            return Ok(Self::Now);
        }

        humantime_serde::re::humantime::parse_duration(trimmed)
            .map(Self::Every)
            .map_err(|e| format!("invalid schedule {value:?}: {e}"))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Now => f.write_str("now"),
            Self::Every(d) => write!(f, "every {}", humantime_serde::re::humantime::format_duration(*d)),
        }
    }
}

/// A unit of background work driven by a [`TaskRunner`].
pub trait Task: Send + Sync + 'static {
    /// Short name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Lag subtracted from "now" to form the watermark passed to `execute`.
    fn default_lag(&self) -> Duration;

    /// One-time preparation before the first run.
    fn setup(&self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Do one round of work for data up to `watermark` (µs since epoch).
    fn execute(&self, watermark: i64) -> impl Future<Output = Result<()>> + Send;

    /// Release resources once the runner is joined.
    fn teardown(&self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

/// Runs a [`Task`] on its schedule without ever overlapping executions.
///
/// The next firing is only awaited after the current execution returns, so a
/// slow run delays (and skips) later ticks instead of running concurrently.
/// Cancellation stops future firings but never interrupts a run in flight.
pub struct TaskRunner<T: Task> {
    task: Arc<T>,
    schedule: Schedule,
    lag: Duration,
    metrics: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    ready: AtomicBool,
}

impl<T: Task> TaskRunner<T> {
    /// Create a runner. `lag` overrides the task's default lag when set.
    pub fn new(task: T, schedule: Schedule, lag: Option<Duration>) -> Self {
        let lag = lag.unwrap_or_else(|| task.default_lag());
        Self {
            task: Arc::new(task),
            schedule,
            lag,
            metrics: None,
            cancel: CancellationToken::new(),
            handle: parking_lot::Mutex::new(None),
            ready: AtomicBool::new(false),
        }
    }

    /// Record execution counts and durations in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    pub fn lag(&self) -> Duration {
        self.lag
    }

    /// Prepare the task. Must be called before `start`.
    pub async fn setup(&self) -> Result<()> {
        self.task.setup().await?;
        self.ready.store(true, Ordering::SeqCst);
        debug!(task = self.task.name(), "task setup complete");
        Ok(())
    }

    /// Current watermark: now minus the configured lag.
    pub fn watermark(&self) -> i64 {
        now_micros() - duration_micros(self.lag)
    }

    /// Start the task.
    ///
    /// With [`Schedule::Now`] this runs a single execution, joins, and returns.
    /// Otherwise the schedule is registered and this returns immediately.
    pub async fn start(&self) -> Result<()> {
        if !self.ready.load(Ordering::SeqCst) {
            bail!("task {} started before setup", self.task.name());
        }

        match self.schedule {
            Schedule::Now => {
                info!(task = self.task.name(), "running task once");
                self.run_once().await;
                self.join().await
            }
            Schedule::Every(interval) => {
                if interval.is_zero() {
                    bail!("task {} has a zero interval", self.task.name());
                }

                let mut slot = self.handle.lock();
                if slot.is_some() {
                    bail!("task {} already started", self.task.name());
                }

                let task = Arc::clone(&self.task);
                let metrics = self.metrics.clone();
                let cancel = self.cancel.clone();
                let lag = self.lag;

                *slot = Some(tokio::spawn(async move {
                    let start = tokio::time::Instant::now() + interval;
                    let mut ticker = tokio::time::interval_at(start, interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                debug!(task = task.name(), "task schedule cancelled");
                                return;
                            }
                            _ = ticker.tick() => {
                                let watermark = now_micros() - duration_micros(lag);
                                execute_once(task.as_ref(), watermark, metrics.as_deref()).await;
                            }
                        }
                    }
                }));

                info!(
                    task = self.task.name(),
                    schedule = %self.schedule,
                    lag = ?self.lag,
                    "task scheduled",
                );

                Ok(())
            }
        }
    }

    /// Execute once at the current watermark. Returns whether it succeeded.
    pub async fn run_once(&self) -> bool {
        execute_once(self.task.as_ref(), self.watermark(), self.metrics.as_deref()).await
    }

    /// Execute once at an explicit watermark.
    pub async fn run_at(&self, watermark: i64) -> bool {
        execute_once(self.task.as_ref(), watermark, self.metrics.as_deref()).await
    }

    /// Cancel the schedule, wait for any in-flight run, and tear the task down.
    pub async fn join(&self) -> Result<()> {
        self.cancel.cancel();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(task = self.task.name(), error = %e, "task loop join failed");
            }
        }

        self.task.teardown().await
    }
}

/// Run the task body, catching and logging any failure.
async fn execute_once<T: Task>(task: &T, watermark: i64, metrics: Option<&HealthMetrics>) -> bool {
    let name = task.name();
    let started = Instant::now();

    debug!(task = name, watermark, "executing task");
    let result = task.execute(watermark).await;
    let elapsed = started.elapsed();

    if let Some(m) = metrics {
        m.task_executions.with_label_values(&[name]).inc();
        m.task_duration
            .with_label_values(&[name])
            .observe(elapsed.as_secs_f64());
    }

    match result {
        Ok(()) => {
            debug!(task = name, elapsed_ms = elapsed.as_millis() as u64, "task execution complete");
            true
        }
        Err(e) => {
            if let Some(m) = metrics {
                m.task_errors.with_label_values(&[name]).inc();
            }
            error!(task = name, watermark, error = %format!("{e:#}"), "task execution failed");
            false
        }
    }
}
