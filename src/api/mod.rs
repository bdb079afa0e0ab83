//! HTTP surface producers talk to.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::{CacheBackend, ShardCache};
use crate::health::bind_addr;
use crate::model::clock::now_micros;
use crate::model::{Event, Level, StorageUsage};
use crate::query::{list_metrics, storage_utilized};
use crate::store::DurableStore;

struct ApiState<B, S> {
    cache: Arc<ShardCache<B>>,
    store: Arc<S>,
}

/// Ingestion and storage query server.
pub struct ApiServer<B, S> {
    addr: String,
    state: Arc<ApiState<B, S>>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl<B: CacheBackend, S: DurableStore> ApiServer<B, S> {
    pub fn new(addr: &str, cache: Arc<ShardCache<B>>, store: Arc<S>) -> Self {
        Self {
            addr: addr.to_string(),
            state: Arc::new(ApiState { cache, store }),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v2/ingest", post(ingest_handler::<B, S>))
            .route("/_/healthcheck", get(healthcheck_handler))
            .route("/v2/storage/:level/:resource", get(storage_handler::<B, S>))
            .with_state(Arc::clone(&self.state))
    }

    /// Bind and serve in the background, returning the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_addr(&self.addr, ":8100");
        let app = self.router();

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            info!(addr = %local_addr, "ingestion api started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                error!(error = %e, "ingestion api server error");
            }
        });

        Ok(local_addr)
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }
}

/// POST /v2/ingest - a JSON array of events.
async fn ingest_handler<B: CacheBackend, S: DurableStore>(
    State(state): State<Arc<ApiState<B, S>>>,
    Json(events): Json<Vec<Event>>,
) -> StatusCode {
    let now = now_micros();
    let total = events.len();
    let mut failed = 0;

    for mut event in events {
        event.operation_id = event.operation_id.normalize();
        event.ensure_identity(now);
        if !state.cache.push_metric(&event).await {
            failed += 1;
        }
    }

    if failed > 0 {
        error!(total, failed, "some metrics could not be buffered");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    debug!(total, "buffered metrics");
    StatusCode::OK
}

/// GET /_/healthcheck
async fn healthcheck_handler() -> StatusCode {
    StatusCode::OK
}

/// GET /v2/storage/:level/:resource
async fn storage_handler<B: CacheBackend, S: DurableStore>(
    State(state): State<Arc<ApiState<B, S>>>,
    Path((level, resource)): Path<(String, String)>,
) -> Response {
    let Some(level) = Level::from_service(&level) else {
        return (StatusCode::NOT_FOUND, format!("unknown level {level:?}")).into_response();
    };

    match storage_usage(&state, level, &resource).await {
        Ok(usage) => Json(usage).into_response(),
        Err(e) => {
            error!(level = level.label(), resource = %resource, error = %format!("{e:#}"), "storage query failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn storage_usage<B: CacheBackend, S: DurableStore>(
    state: &ApiState<B, S>,
    level: Level,
    resource: &str,
) -> Result<StorageUsage> {
    let now = now_micros();
    let record = list_metrics(state.store.as_ref(), level, resource, now).await?;

    let storage_utilized = match level {
        Level::Account => storage_utilized(&state.cache, state.store.as_ref(), resource, now).await?,
        _ => record.size_delta,
    };

    Ok(StorageUsage {
        storage_utilized,
        number_of_objects: record.object_delta,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::MemoryBackend;
    use crate::store::MemoryStore;

    fn server() -> ApiServer<MemoryBackend, MemoryStore> {
        let cache = ShardCache::new(MemoryBackend::new(Duration::from_secs(60)), Duration::from_secs(10));
        ApiServer::new("127.0.0.1:0", Arc::new(cache), Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_ingest_buffers_events() {
        let server = server();
        let event = Event::new(crate::model::OperationId::PutDeleteMarkerObject);

        let status = ingest_handler(State(Arc::clone(&server.state)), Json(vec![event])).await;
        assert_eq!(status, StatusCode::OK);

        let shards = server.state.cache.get_shards().await.expect("shards");
        assert_eq!(shards.len(), 1);
        let stored = server
            .state
            .cache
            .get_metrics_for_shard(shards[0])
            .await
            .expect("events");
        assert_eq!(stored[0].operation_id, crate::model::OperationId::DeleteObject);
        assert!(!stored[0].uuid.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_level_is_not_found() {
        let server = server();
        let resp = storage_handler(
            State(Arc::clone(&server.state)),
            Path(("galaxies".to_string(), "x".to_string())),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_server_start_stop() {
        let server = server();
        let addr = server.start().await.expect("start");
        assert_ne!(addr.port(), 0);
        server.stop().await.expect("stop");
    }
}
