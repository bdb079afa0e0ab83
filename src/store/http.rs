use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Datapoint, DeleteQuery, DurableStore, FetchQuery};
use crate::config::StoreConfig;

/// JSON-over-HTTP store adapter.
///
/// Requests go to the configured hosts in order; a host that fails is skipped
/// and the next one is tried. Reads and procedures carry the read token,
/// ingest and delete carry the write token.
pub struct HttpStore {
    http: reqwest::Client,
    hosts: Vec<String>,
    read_token: String,
    write_token: String,
}

#[derive(Clone, Copy)]
enum Access {
    Read,
    Write,
}

#[derive(Serialize, Deserialize)]
struct IngestResponse {
    written: usize,
}

#[derive(Serialize, Deserialize)]
struct FetchResponse {
    datapoints: Vec<Datapoint>,
}

#[derive(Serialize, Deserialize)]
struct DeleteResponse {
    deleted: usize,
}

impl HttpStore {
    pub fn new(cfg: &StoreConfig) -> Result<Self> {
        if cfg.hosts.is_empty() {
            bail!("store.hosts is required for the http store");
        }

        let timeout = if cfg.request_timeout.is_zero() {
            Duration::from_secs(30)
        } else {
            cfg.request_timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(cfg.connect_timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            hosts: cfg
                .hosts
                .iter()
                .map(|h| h.trim_end_matches('/').to_string())
                .collect(),
            read_token: cfg.read_token.clone(),
            write_token: cfg.write_token.clone(),
        })
    }

    fn token(&self, access: Access) -> &str {
        match access {
            Access::Read => &self.read_token,
            Access::Write => &self.write_token,
        }
    }

    /// POST `body` to `path` on each host in turn until one answers.
    async fn post_json<B, T>(&self, path: &str, access: Access, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut last_err = None;

        for host in &self.hosts {
            match self.post_to(host, path, access, body).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    warn!(host = %host, path, error = %e, "store request failed, trying next host");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| anyhow!("no store hosts configured"))
            .context(format!("all store hosts failed for {path}")))
    }

    async fn post_to<B, T>(&self, host: &str, path: &str, access: Access, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{host}{path}");
        let mut request = self
            .http
            .post(&url)
            .header("Accept", "application/json")
            .json(body);

        let token = self.token(access);
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {status} from {url}: {body}");
        }

        response
            .json()
            .await
            .with_context(|| format!("decoding response from {url}"))
    }
}

impl DurableStore for HttpStore {
    async fn ingest(&self, records: &[Datapoint]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let resp: IngestResponse = self.post_json("/v1/ingest", Access::Write, records).await?;
        debug!(records = records.len(), written = resp.written, "ingested datapoints");
        Ok(resp.written)
    }

    async fn fetch(&self, query: &FetchQuery) -> Result<Vec<Datapoint>> {
        let resp: FetchResponse = self.post_json("/v1/fetch", Access::Read, query).await?;
        Ok(resp.datapoints)
    }

    async fn exec(&self, procedure: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let path = format!("/v1/exec/{procedure}");
        self.post_json(&path, Access::Read, &params).await
    }

    async fn delete(&self, query: &DeleteQuery) -> Result<usize> {
        let resp: DeleteResponse = self.post_json("/v1/delete", Access::Write, query).await?;
        Ok(resp.deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;
    use crate::store::{node_labels, procedure, MemoryStore, EVENT_CLASS};

    struct Fake {
        store: MemoryStore,
        read_token: &'static str,
        write_token: &'static str,
    }

    fn authorized(headers: &HeaderMap, token: &str) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {token}"))
    }

    async fn ingest(
        State(fake): State<Arc<Fake>>,
        headers: HeaderMap,
        Json(records): Json<Vec<Datapoint>>,
    ) -> Result<Json<IngestResponse>, StatusCode> {
        if !authorized(&headers, fake.write_token) {
            return Err(StatusCode::UNAUTHORIZED);
        }
        let written = fake
            .store
            .ingest(&records)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        Ok(Json(IngestResponse { written }))
    }

    async fn fetch(
        State(fake): State<Arc<Fake>>,
        headers: HeaderMap,
        Json(query): Json<FetchQuery>,
    ) -> Result<Json<FetchResponse>, StatusCode> {
        if !authorized(&headers, fake.read_token) {
            return Err(StatusCode::UNAUTHORIZED);
        }
        let datapoints = fake
            .store
            .fetch(&query)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        Ok(Json(FetchResponse { datapoints }))
    }

    async fn exec(
        State(fake): State<Arc<Fake>>,
        Path(name): Path<String>,
        Json(params): Json<Value>,
    ) -> Result<Json<Value>, StatusCode> {
        fake.store
            .exec(&name, params)
            .await
            .map(Json)
            .map_err(|_| StatusCode::BAD_REQUEST)
    }

    async fn spawn_fake() -> (String, Arc<Fake>) {
        let fake = Arc::new(Fake {
            store: MemoryStore::new(),
            read_token: "r",
            write_token: "w",
        });
        let app = Router::new()
            .route("/v1/ingest", post(ingest))
            .route("/v1/fetch", post(fetch))
            .route("/v1/exec/:name", post(exec))
            .with_state(Arc::clone(&fake));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), fake)
    }

    fn config(hosts: Vec<String>) -> StoreConfig {
        StoreConfig {
            hosts,
            read_token: "r".to_string(),
            write_token: "w".to_string(),
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(1),
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_requires_hosts() {
        let err = HttpStore::new(&config(Vec::new())).err().expect("error");
        assert!(err.to_string().contains("store.hosts"));
    }

    #[tokio::test]
    async fn test_fails_over_to_next_host() {
        let (url, fake) = spawn_fake().await;
        // Nothing listens on port 1.
        let store = HttpStore::new(&config(vec!["http://127.0.0.1:1".to_string(), url]))
            .expect("store");

        let written = store
            .ingest(&[Datapoint::new(EVENT_CLASS, node_labels("n1"), 10, json!({"a": 1}))])
            .await
            .expect("ingest");
        assert_eq!(written, 1);
        assert_eq!(fake.store.len(), 1);

        let got = store
            .fetch(&FetchQuery::new(EVENT_CLASS, node_labels("n1"), 0, 10))
            .await
            .expect("fetch");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value["a"], 1);

        let oldest = store
            .exec(procedure::OLDEST, Value::Null)
            .await
            .expect("exec");
        assert_eq!(oldest, json!(10));
    }

    #[tokio::test]
    async fn test_wrong_token_is_an_error() {
        let (url, _fake) = spawn_fake().await;
        let mut cfg = config(vec![url]);
        cfg.write_token = "nope".to_string();
        let store = HttpStore::new(&cfg).expect("store");

        let err = store
            .ingest(&[Datapoint::new(EVENT_CLASS, node_labels("n1"), 10, json!(1))])
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("401"));
    }
}
