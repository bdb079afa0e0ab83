use std::time::Duration;

use serial_test::serial;

use meterd::config::{Config, StoreBackendKind};
use meterd::tasks::Schedule;

const YAML: &str = r#"
node_id: from-file
cache:
  shard_width: 10s
tasks:
  checkpoint:
    schedule: now
    lag: 2m
client:
  max_cached_metrics: 10
"#;

const VARS: [&str; 3] = ["METERD_NODE_ID", "METERD_STORE_HOSTS", "METERD_DISK_USAGE_LEADER"];

fn clear_env() {
    for var in VARS {
        std::env::remove_var(var);
    }
}

fn write_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("meterd.yaml");
    std::fs::write(&path, YAML).expect("write config");
    path
}

#[test]
#[serial]
fn test_load_file_without_env() {
    clear_env();
    let dir = tempfile::tempdir().expect("tempdir");

    let cfg = Config::load(&write_config(&dir)).expect("load");
    assert_eq!(cfg.node_id, "from-file");
    assert_eq!(cfg.cache.shard_width, Duration::from_secs(10));
    assert_eq!(cfg.tasks.checkpoint.schedule, Schedule::Now);
    assert_eq!(cfg.tasks.checkpoint.lag, Some(Duration::from_secs(120)));
    assert_eq!(cfg.client.max_cached_metrics, 10);
    assert_eq!(cfg.store.backend, StoreBackendKind::Memory);
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    clear_env();
    std::env::set_var("METERD_NODE_ID", "from-env");
    std::env::set_var("METERD_STORE_HOSTS", "http://s1:4802,http://s2:4802");
    std::env::set_var("METERD_DISK_USAGE_LEADER", "enable");

    let dir = tempfile::tempdir().expect("tempdir");
    let result = Config::load(&write_config(&dir));
    clear_env();

    let cfg = result.expect("load");
    assert_eq!(cfg.node_id, "from-env");
    assert_eq!(cfg.store.backend, StoreBackendKind::Http);
    assert_eq!(cfg.store.hosts.len(), 2);
    assert!(cfg.disk_usage.leader);
}

#[test]
#[serial]
fn test_missing_node_id_fails_fast() {
    clear_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("empty.yaml");
    std::fs::write(&path, "log_level: debug\n").expect("write config");

    let err = Config::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("node_id is required"));
}
