use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "meterd";

/// Prometheus metrics for the daemon and its background tasks.
///
/// All metrics use the "meterd" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Task scheduler ===
    /// Executions by task name.
    pub task_executions: CounterVec,
    /// Failed executions by task name.
    pub task_errors: CounterVec,
    /// Execution duration by task name.
    pub task_duration: HistogramVec,

    // === Shard ingestion ===
    /// Events written to the durable store.
    pub ingest_events: Counter,
    /// Events written to the repair class because their shard was late.
    pub ingest_slow_events: Counter,
    /// Shards drained from the cache.
    pub ingest_shards: Counter,
    /// Sum of shard ages at ingestion time, in seconds.
    pub ingest_shard_age_seconds: Counter,

    // === Compaction ===
    /// Records written by kind (checkpoint/snapshot/correction).
    pub compaction_records: CounterVec,

    // === Backend client ===
    /// Backend connection state by backend (0=disconnected .. 3=ready).
    pub backend_state: GaugeVec,
    /// Backend connection re-initializations.
    pub backend_reconnects: CounterVec,

    // === Retry cache ===
    /// Entries currently held in the producer retry cache.
    pub retry_cache_entries: Gauge,
    /// Metrics that could not be cached and went to the recovery log.
    pub retry_cache_overflow: Counter,

    // === Disk usage ===
    /// Measured durable store size in bytes.
    pub disk_usage_bytes: Gauge,
    /// Whether the store is write-locked (1=yes, 0=no).
    pub disk_usage_locked: Gauge,
    /// Expiration deletes issued.
    pub expired_chunks: Counter,
}

fn counter(name: &str, help: &str) -> Result<Counter> {
    Ok(Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> Result<CounterVec> {
    Ok(CounterVec::new(
        Opts::new(name, help).namespace(NAMESPACE),
        labels,
    )?)
}

fn gauge(name: &str, help: &str) -> Result<Gauge> {
    Ok(Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let task_executions = counter_vec(
            "task_executions_total",
            "Task executions by task.",
            &["task"],
        )?;
        let task_errors = counter_vec(
            "task_errors_total",
            "Failed task executions by task.",
            &["task"],
        )?;
        let task_duration = HistogramVec::new(
            HistogramOpts::new("task_duration_seconds", "Task execution duration.")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
            &["task"],
        )?;

        let ingest_events = counter(
            "ingest_events_total",
            "Events written to the durable store.",
        )?;
        let ingest_slow_events = counter(
            "ingest_slow_events_total",
            "Events ingested into the repair class.",
        )?;
        let ingest_shards = counter("ingest_shards_total", "Shards drained from the cache.")?;
        let ingest_shard_age_seconds = counter(
            "ingest_shard_age_seconds_total",
            "Sum of shard ages at ingestion time.",
        )?;

        let compaction_records = counter_vec(
            "compaction_records_total",
            "Compaction records written by kind.",
            &["kind"],
        )?;

        let backend_state = GaugeVec::new(
            Opts::new(
                "backend_state",
                "Backend connection state (0=disconnected, 1=connecting, 2=connected, 3=ready).",
            )
            .namespace(NAMESPACE),
            &["backend"],
        )?;
        let backend_reconnects = counter_vec(
            "backend_reconnects_total",
            "Backend connection re-initializations.",
            &["backend"],
        )?;

        let retry_cache_entries = gauge(
            "retry_cache_entries",
            "Entries held in the producer retry cache.",
        )?;
        let retry_cache_overflow = counter(
            "retry_cache_overflow_total",
            "Metrics sent to the recovery log because the retry cache was full.",
        )?;

        let disk_usage_bytes = gauge("disk_usage_bytes", "Durable store size on disk.")?;
        let disk_usage_locked = gauge(
            "disk_usage_locked",
            "Whether the durable store is write-locked.",
        )?;
        let expired_chunks = counter(
            "expired_chunks_total",
            "Retention expiration deletes issued.",
        )?;

        registry.register(Box::new(task_executions.clone()))?;
        registry.register(Box::new(task_errors.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(ingest_events.clone()))?;
        registry.register(Box::new(ingest_slow_events.clone()))?;
        registry.register(Box::new(ingest_shards.clone()))?;
        registry.register(Box::new(ingest_shard_age_seconds.clone()))?;
        registry.register(Box::new(compaction_records.clone()))?;
        registry.register(Box::new(backend_state.clone()))?;
        registry.register(Box::new(backend_reconnects.clone()))?;
        registry.register(Box::new(retry_cache_entries.clone()))?;
        registry.register(Box::new(retry_cache_overflow.clone()))?;
        registry.register(Box::new(disk_usage_bytes.clone()))?;
        registry.register(Box::new(disk_usage_locked.clone()))?;
        registry.register(Box::new(expired_chunks.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            task_executions,
            task_errors,
            task_duration,
            ingest_events,
            ingest_slow_events,
            ingest_shards,
            ingest_shard_age_seconds,
            compaction_records,
            backend_state,
            backend_reconnects,
            retry_cache_entries,
            retry_cache_overflow,
            disk_usage_bytes,
            disk_usage_locked,
            expired_chunks,
        })
    }

    /// Render all registered metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Starts the HTTP server serving `/metrics` and `/healthz`.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = bind_addr(&self.addr, ":9090");

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Resolve a listen address, expanding the ":port" shorthand.
pub fn bind_addr(addr: &str, fallback: &str) -> String {
    let addr = if addr.is_empty() { fallback } else { addr };

    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_addr_shorthand() {
        assert_eq!(bind_addr(":9090", ":1"), "0.0.0.0:9090");
        assert_eq!(bind_addr("127.0.0.1:8000", ":1"), "127.0.0.1:8000");
        assert_eq!(bind_addr("", ":8100"), "0.0.0.0:8100");
    }

    #[test]
    fn test_metrics_render_with_namespace() {
        let m = HealthMetrics::new(":0").expect("metrics");
        m.ingest_events.inc_by(3.0);
        m.task_executions.with_label_values(&["ingest"]).inc();

        let text = m.render().expect("render");
        assert!(text.contains("meterd_ingest_events_total 3"));
        assert!(text.contains("meterd_task_executions_total{task=\"ingest\"} 1"));
    }

    #[tokio::test]
    async fn test_server_start_stop() {
        let m = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        m.start().await.expect("start");
        m.stop().await.expect("stop");
    }
}
