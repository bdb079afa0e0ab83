use std::sync::Arc;
use std::time::Duration;

use meterd::api::ApiServer;
use meterd::cache::{MemoryBackend, ShardCache};
use meterd::client::adjust::{push_adjustment, Adjustment};
use meterd::client::MeterClient;
use meterd::config::ClientConfig;
use meterd::model::clock::now_micros;
use meterd::model::{Event, Level, OperationId};
use meterd::store::MemoryStore;
use meterd::tasks::checkpoint::CheckpointTask;
use meterd::tasks::ingest::IngestShardTask;
use meterd::tasks::Task;

fn push(account: &str, bucket: &str, size: i64, objects: i64) -> Event {
    let mut e = Event::new(OperationId::PutObject);
    e.account = Some(account.to_string());
    e.bucket = Some(bucket.to_string());
    e.size_delta = Some(size);
    e.object_delta = Some(objects);
    e
}

#[tokio::test]
async fn test_client_to_storage_query() {
    let cache = Arc::new(ShardCache::new(
        MemoryBackend::new(Duration::from_secs(3600)),
        Duration::from_secs(1),
    ));
    let store = Arc::new(MemoryStore::new());
    let server = ApiServer::new("127.0.0.1:0", Arc::clone(&cache), Arc::clone(&store));
    let addr = server.start().await.expect("start api");

    let client = MeterClient::new(&ClientConfig {
        endpoint: format!("http://{addr}"),
        disable_retry_cache: true,
        ..ClientConfig::default()
    })
    .expect("client");

    client.push_metric(push("a1", "b1", 300, 2)).await.expect("push");
    client.push_metric(push("a1", "b2", -50, -1)).await.expect("push");

    let ingest = IngestShardTask::new(
        Arc::clone(&cache),
        Arc::clone(&store),
        "n1",
        Duration::from_secs(300),
    );
    // Shards are one second wide; look past the current one.
    ingest.execute(now_micros() + 2_000_000).await.expect("ingest");
    CheckpointTask::new(Arc::clone(&store), "n1")
        .execute(now_micros() + 2_000_000)
        .await
        .expect("checkpoint");

    // The query runs at "now", after the checkpoint window it reads from.
    tokio::time::sleep(Duration::from_millis(2100)).await;

    let account = client.get_storage(Level::Account, "a1").await.expect("account");
    assert_eq!(account.storage_utilized, 250);
    assert_eq!(account.number_of_objects, 1);

    let bucket = client.get_storage(Level::Bucket, "b2").await.expect("bucket");
    // Negative totals are shown as zero.
    assert_eq!(bucket.storage_utilized, 0);
    assert_eq!(bucket.number_of_objects, 0);

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn test_healthcheck_and_bad_body() {
    let cache = Arc::new(ShardCache::new(
        MemoryBackend::new(Duration::from_secs(60)),
        Duration::from_secs(10),
    ));
    let server = ApiServer::new("127.0.0.1:0", cache, Arc::new(MemoryStore::new()));
    let addr = server.start().await.expect("start api");
    let http = reqwest::Client::new();

    let health = http
        .get(format!("http://{addr}/_/healthcheck"))
        .send()
        .await
        .expect("healthcheck");
    assert_eq!(health.status(), reqwest::StatusCode::OK);

    let bad = http
        .post(format!("http://{addr}/v2/ingest"))
        .header("content-type", "application/json")
        .body(r#"[{"operationId": "notAnOperation"}]"#)
        .send()
        .await
        .expect("post");
    assert!(bad.status().is_client_error());

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn test_adjustment_reaches_only_its_target() {
    let cache = Arc::new(ShardCache::new(
        MemoryBackend::new(Duration::from_secs(3600)),
        Duration::from_secs(1),
    ));
    let store = Arc::new(MemoryStore::new());
    let server = ApiServer::new("127.0.0.1:0", Arc::clone(&cache), Arc::clone(&store));
    let addr = server.start().await.expect("start api");

    let client = MeterClient::new(&ClientConfig {
        endpoint: format!("http://{addr}"),
        disable_retry_cache: true,
        ..ClientConfig::default()
    })
    .expect("client");

    client.push_metric(push("a1", "b1", 1000, 4)).await.expect("push");
    let adjustment = Adjustment {
        buckets: vec!["b1".to_string()],
        object_delta: -1,
        size_delta: -200,
        ..Adjustment::default()
    };
    assert_eq!(push_adjustment(&client, &adjustment).await.expect("adjust"), 1);

    IngestShardTask::new(Arc::clone(&cache), Arc::clone(&store), "n1", Duration::from_secs(300))
        .execute(now_micros() + 2_000_000)
        .await
        .expect("ingest");
    CheckpointTask::new(Arc::clone(&store), "n1")
        .execute(now_micros() + 2_000_000)
        .await
        .expect("checkpoint");
    tokio::time::sleep(Duration::from_millis(2100)).await;

    let bucket = client.get_storage(Level::Bucket, "b1").await.expect("bucket");
    assert_eq!(bucket.storage_utilized, 800);
    assert_eq!(bucket.number_of_objects, 3);

    let account = client.get_storage(Level::Account, "a1").await.expect("account");
    assert_eq!(account.storage_utilized, 1000);
    assert_eq!(account.number_of_objects, 4);

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn test_adjustment_failure_is_reported() {
    // Nothing listens on this port.
    let client = MeterClient::new(&ClientConfig {
        endpoint: "http://127.0.0.1:1".to_string(),
        disable_retry_cache: true,
        ..ClientConfig::default()
    })
    .expect("client");

    let adjustment = Adjustment {
        accounts: vec!["a1".to_string()],
        size_delta: 10,
        ..Adjustment::default()
    };
    let err = push_adjustment(&client, &adjustment).await.unwrap_err();
    assert!(format!("{err:#}").contains("pushing adjustment 1 of 1"));
    assert_eq!(client.cached().await.expect("cached"), 0);
}
