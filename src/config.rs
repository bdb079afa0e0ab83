use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::tasks::Schedule;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "METERD_";

/// Values accepted as "true" for boolean environment overrides.
const TRUTHY: [&str; 8] = ["true", "on", "yes", "y", "t", "enabled", "enable", "1"];

/// Top-level configuration for the meterd daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identifies this node in every series it writes.
    #[serde(default)]
    pub node_id: String,

    /// Ingestion API listen address. Default: ":8100".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Shard cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Durable time-series store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Background task schedules.
    #[serde(default)]
    pub tasks: TasksConfig,

    /// Disk usage backpressure and retention configuration.
    #[serde(default)]
    pub disk_usage: DiskUsageConfig,

    /// Producer client configuration.
    #[serde(default)]
    pub client: ClientConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Which shard cache backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    /// Process-local, for single-node deployments and tests.
    #[default]
    Memory,
    /// Shared redis backend for multi-node deployments.
    Redis,
}

/// Shard cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Cache backend. Default: memory.
    #[serde(default)]
    pub backend: CacheBackendKind,

    /// Width of one time shard. Default: 10s.
    #[serde(default = "default_shard_width", with = "humantime_serde")]
    pub shard_width: Duration,

    /// How long an account size base stays valid. Default: 24h.
    #[serde(default = "default_counter_base_ttl", with = "humantime_serde")]
    pub counter_base_ttl: Duration,

    /// Redis connection settings (used when backend is redis).
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis host for a standalone server. Default: "localhost".
    #[serde(default = "default_redis_host")]
    pub host: String,

    /// Redis port. Default: 6379.
    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub db: i64,

    /// Sentinel topology. When set, host/port are ignored.
    #[serde(default)]
    pub sentinel: Option<SentinelConfig>,

    /// Prefix for every key written. Default: "meterd".
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-command timeout, applied only with sentinels. Default: 10s.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Window for the connection to become ready before it is re-initialized. Default: 30s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// How long a call waits for a ready connection before failing. Default: 30s.
    #[serde(default = "default_retry_deadline", with = "humantime_serde")]
    pub retry_deadline: Duration,
}

/// Redis sentinel configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SentinelConfig {
    /// Name of the monitored master. Default: "meterd".
    #[serde(default = "default_sentinel_name")]
    pub name: String,

    #[serde(default)]
    pub sentinels: Vec<HostPort>,

    /// Password for the resolved master.
    #[serde(default)]
    pub password: String,

    /// Password for the sentinels themselves.
    #[serde(default)]
    pub sentinel_password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

/// Which durable store adapter to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendKind {
    #[default]
    Memory,
    Http,
}

/// Durable time-series store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Store adapter. Default: memory.
    #[serde(default)]
    pub backend: StoreBackendKind,

    /// Store base URLs, tried in order on failure.
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub read_token: String,

    #[serde(default)]
    pub write_token: String,

    /// Request timeout. Default: 30s.
    #[serde(default = "default_store_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Connect timeout. Default: 30s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Schedules for every background task.
#[derive(Debug, Clone, Deserialize)]
pub struct TasksConfig {
    #[serde(default = "default_ingest_task")]
    pub ingest: TaskConfig,

    #[serde(default = "default_checkpoint_task")]
    pub checkpoint: TaskConfig,

    #[serde(default = "default_snapshot_task")]
    pub snapshot: TaskConfig,

    #[serde(default = "default_repair_task")]
    pub repair: TaskConfig,

    #[serde(default = "default_disk_usage_task")]
    pub disk_usage: TaskConfig,
}

/// Schedule for a single task.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// "now" to run once, or an interval such as "30s".
    pub schedule: Schedule,

    /// Watermark lag override. Each task has its own default.
    #[serde(default, with = "humantime_serde")]
    pub lag: Option<Duration>,
}

/// Operator override for the store write lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualOverride {
    Lock,
    Unlock,
}

/// Disk usage backpressure and retention configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiskUsageConfig {
    /// Directory holding the durable store's data.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Hard limit as a size spec, e.g. "500GB" or "2TiB".
    #[serde(default)]
    pub hard_limit: Option<String>,

    /// Fraction of the hard limit that triggers a warning. Default: 0.8.
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: f64,

    /// Fraction of the hard limit that locks the store. Default: 0.95.
    #[serde(default = "default_action_threshold")]
    pub action_threshold: f64,

    /// Data older than this is expired. Unset disables expiration.
    #[serde(default, with = "humantime_serde")]
    pub retention: Option<Duration>,

    /// Only the leader runs expiration. Default: false.
    #[serde(default)]
    pub leader: bool,

    /// Width of each expiration delete. Default: 15m.
    #[serde(default = "default_expiration_chunk", with = "humantime_serde")]
    pub expiration_chunk: Duration,

    /// Manual lock/unlock, bypassing measurement.
    #[serde(default)]
    pub manual: Option<ManualOverride>,
}

/// Producer client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Ingestion endpoint base URL. Default: "http://localhost:8100".
    #[serde(default = "default_client_endpoint")]
    pub endpoint: String,

    /// Retry cache capacity. Default: 200000.
    #[serde(default = "default_max_cached_metrics")]
    pub max_cached_metrics: usize,

    /// Delay before a scheduled drain runs. Default: 30s.
    #[serde(default = "default_drain_delay", with = "humantime_serde")]
    pub drain_delay: Duration,

    /// Metrics per re-delivery request. Default: 100.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// HTTP request timeout. Default: 10s.
    #[serde(default = "default_client_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Retry cache database file. Unset keeps the cache in memory.
    #[serde(default)]
    pub retry_cache_path: Option<PathBuf>,

    /// Surface delivery errors instead of caching. Default: false.
    #[serde(default)]
    pub disable_retry_cache: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_addr() -> String {
    ":8100".to_string()
}

fn default_true() -> bool {
    true
}

fn default_shard_width() -> Duration {
    Duration::from_secs(10)
}

fn default_counter_base_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "meterd".to_string()
}

fn default_sentinel_name() -> String {
    "meterd".to_string()
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_deadline() -> Duration {
    Duration::from_secs(30)
}

fn default_store_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn task(enabled: bool, schedule: Schedule) -> TaskConfig {
    TaskConfig {
        enabled,
        schedule,
        lag: None,
    }
}

fn default_ingest_task() -> TaskConfig {
    task(true, Schedule::Every(Duration::from_secs(5)))
}

fn default_checkpoint_task() -> TaskConfig {
    task(true, Schedule::Every(Duration::from_secs(30)))
}

fn default_snapshot_task() -> TaskConfig {
    task(true, Schedule::Every(Duration::from_secs(60 * 60)))
}

fn default_repair_task() -> TaskConfig {
    task(true, Schedule::Every(Duration::from_secs(5 * 60)))
}

fn default_disk_usage_task() -> TaskConfig {
    task(false, Schedule::Every(Duration::from_secs(15 * 60)))
}

fn default_warn_threshold() -> f64 {
    0.8
}

fn default_action_threshold() -> f64 {
    0.95
}

fn default_expiration_chunk() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_client_endpoint() -> String {
    "http://localhost:8100".to_string()
}

fn default_max_cached_metrics() -> usize {
    200_000
}

fn default_drain_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_chunk_size() -> usize {
    100
}

fn default_client_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            node_id: String::new(),
            listen_addr: default_listen_addr(),
            cache: CacheConfig::default(),
            store: StoreConfig::default(),
            tasks: TasksConfig::default(),
            disk_usage: DiskUsageConfig::default(),
            client: ClientConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::default(),
            shard_width: default_shard_width(),
            counter_base_ttl: default_counter_base_ttl(),
            redis: RedisConfig::default(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: String::new(),
            db: 0,
            sentinel: None,
            key_prefix: default_key_prefix(),
            command_timeout: default_command_timeout(),
            connect_timeout: default_connect_timeout(),
            retry_deadline: default_retry_deadline(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::default(),
            hosts: Vec::new(),
            read_token: String::new(),
            write_token: String::new(),
            request_timeout: default_store_request_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            ingest: default_ingest_task(),
            checkpoint: default_checkpoint_task(),
            snapshot: default_snapshot_task(),
            repair: default_repair_task(),
            disk_usage: default_disk_usage_task(),
        }
    }
}

impl Default for DiskUsageConfig {
    fn default() -> Self {
        Self {
            path: None,
            hard_limit: None,
            warn_threshold: default_warn_threshold(),
            action_threshold: default_action_threshold(),
            retention: None,
            leader: false,
            expiration_chunk: default_expiration_chunk(),
            manual: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_client_endpoint(),
            max_cached_metrics: default_max_cached_metrics(),
            drain_delay: default_drain_delay(),
            chunk_size: default_chunk_size(),
            request_timeout: default_client_request_timeout(),
            retry_cache_path: None,
            disable_retry_cache: false,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.apply_env_overrides()?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Override settings from `METERD_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Override settings using `lookup` to resolve variable names.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("NODE_ID") {
            self.node_id = v;
        }

        if let Some(v) = var("CACHE_BACKEND") {
            self.cache.backend = match v.to_ascii_lowercase().as_str() {
                "memory" => CacheBackendKind::Memory,
                "redis" => CacheBackendKind::Redis,
                other => bail!("{ENV_PREFIX}CACHE_BACKEND: unknown backend {other}"),
            };
        }

        if let Some(v) = var("REDIS_HOST") {
            self.cache.redis.host = v;
        }

        if let Some(v) = var("REDIS_PORT") {
            self.cache.redis.port = v
                .parse()
                .with_context(|| format!("{ENV_PREFIX}REDIS_PORT: invalid port {v}"))?;
        }

        if let Some(v) = var("REDIS_PASSWORD") {
            self.cache.redis.password = v;
        }

        if let Some(v) = var("STORE_HOSTS") {
            self.store.backend = StoreBackendKind::Http;
            self.store.hosts = v
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(v) = var("STORE_READ_TOKEN") {
            self.store.read_token = v;
        }

        if let Some(v) = var("STORE_WRITE_TOKEN") {
            self.store.write_token = v;
        }

        if let Some(v) = var("DISK_USAGE_LIMIT") {
            self.disk_usage.hard_limit = Some(v);
        }

        if let Some(v) = var("DISK_USAGE_LEADER") {
            self.disk_usage.leader = is_truthy(&v);
        }

        Ok(())
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            bail!("node_id is required");
        }

        if self.cache.shard_width.is_zero() {
            bail!("cache.shard_width must be positive");
        }

        if self.cache.counter_base_ttl.is_zero() {
            bail!("cache.counter_base_ttl must be positive");
        }

        if self.cache.backend == CacheBackendKind::Redis {
            let redis = &self.cache.redis;
            match &redis.sentinel {
                Some(sentinel) => {
                    if sentinel.sentinels.is_empty() {
                        bail!("cache.redis.sentinel.sentinels is required");
                    }
                    if sentinel.name.is_empty() {
                        bail!("cache.redis.sentinel.name is required");
                    }
                }
                None => {
                    if redis.host.is_empty() {
                        bail!("cache.redis.host is required");
                    }
                }
            }

            if redis.connect_timeout.is_zero() {
                bail!("cache.redis.connect_timeout must be positive");
            }
        }

        if self.store.backend == StoreBackendKind::Http && self.store.hosts.is_empty() {
            bail!("store.hosts is required for the http store");
        }

        for (name, task) in self.tasks.iter() {
            if let Schedule::Every(interval) = task.schedule {
                if interval.is_zero() {
                    bail!("tasks.{name}.schedule must be positive");
                }
            }
        }

        self.validate_disk_usage()?;

        if self.client.chunk_size == 0 {
            bail!("client.chunk_size must be positive");
        }

        if self.client.max_cached_metrics == 0 {
            bail!("client.max_cached_metrics must be positive");
        }

        Ok(())
    }

    fn validate_disk_usage(&self) -> Result<()> {
        let du = &self.disk_usage;

        if !(du.warn_threshold > 0.0 && du.warn_threshold <= 1.0) {
            bail!("disk_usage.warn_threshold must be in (0, 1]");
        }

        if !(du.action_threshold > 0.0 && du.action_threshold <= 1.0) {
            bail!("disk_usage.action_threshold must be in (0, 1]");
        }

        if du.warn_threshold > du.action_threshold {
            bail!("disk_usage.warn_threshold must not exceed action_threshold");
        }

        if du.expiration_chunk.is_zero() {
            bail!("disk_usage.expiration_chunk must be positive");
        }

        if let Some(spec) = &du.hard_limit {
            parse_size(spec).context("disk_usage.hard_limit")?;
        }

        if self.tasks.disk_usage.enabled && du.manual.is_none() {
            if du.path.is_none() {
                bail!("disk_usage.path is required when the disk usage task is enabled");
            }
            if du.hard_limit.is_none() {
                bail!("disk_usage.hard_limit is required when the disk usage task is enabled");
            }
        }

        Ok(())
    }
}

impl TasksConfig {
    /// Every task config paired with its name.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &TaskConfig)> {
        [
            ("ingest", &self.ingest),
            ("checkpoint", &self.checkpoint),
            ("snapshot", &self.snapshot),
            ("repair", &self.repair),
            ("disk_usage", &self.disk_usage),
        ]
        .into_iter()
    }
}

impl DiskUsageConfig {
    /// Hard limit in bytes, if configured.
    pub fn hard_limit_bytes(&self) -> Result<Option<u64>> {
        self.hard_limit.as_deref().map(parse_size).transpose()
    }
}

/// Whether an environment value reads as true.
pub fn is_truthy(value: &str) -> bool {
    let lower = value.trim().to_ascii_lowercase();
    TRUTHY.contains(&lower.as_str())
}

/// Parse a size spec like "512", "10k", "5GB" or "2TiB" into bytes (powers of 1024).
pub fn parse_size(spec: &str) -> Result<u64> {
    let s = spec.trim().to_ascii_lowercase();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());

    if digits_end == 0 {
        bail!("invalid size spec {spec:?}: missing number");
    }

    let number: u64 = s[..digits_end]
        .parse()
        .with_context(|| format!("invalid size spec {spec:?}"))?;

    let mut rest = s[digits_end..].chars();
    let exponent = match rest.next() {
        None => return Ok(number),
        Some('b') => 0,
        Some('k') => 1,
        Some('m') => 2,
        Some('g') => 3,
        Some('t') => 4,
        Some('p') => 5,
        Some('e') => 6,
        Some(other) => bail!("invalid size spec {spec:?}: unknown unit {other:?}"),
    };

    // Optional "b" or "ib" suffix after the unit letter.
    let suffix: String = rest.collect();
    if exponent > 0 && !matches!(suffix.as_str(), "" | "b" | "ib") {
        bail!("invalid size spec {spec:?}: unexpected suffix {suffix:?}");
    }
    if exponent == 0 && !suffix.is_empty() {
        bail!("invalid size spec {spec:?}: unexpected suffix {suffix:?}");
    }

    number
        .checked_mul(1024u64.pow(exponent))
        .with_context(|| format!("size spec {spec:?} overflows"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn valid_config() -> Config {
        Config {
            node_id: "node-1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.cache.shard_width, Duration::from_secs(10));
        assert_eq!(cfg.cache.counter_base_ttl, Duration::from_secs(86400));
        assert_eq!(cfg.cache.redis.command_timeout, Duration::from_secs(10));
        assert_eq!(cfg.client.max_cached_metrics, 200_000);
        assert_eq!(cfg.client.drain_delay, Duration::from_secs(30));
        assert_eq!(cfg.client.chunk_size, 100);
        assert_eq!(cfg.disk_usage.warn_threshold, 0.8);
        assert_eq!(cfg.disk_usage.action_threshold, 0.95);
        assert!(!cfg.tasks.disk_usage.enabled);
        assert_eq!(cfg.health.addr, ":9090");
    }

    #[test]
    fn test_validation_valid_config() {
        valid_config().validate().expect("valid config");
    }

    #[test]
    fn test_validation_missing_node_id() {
        let cfg = Config::default();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("node_id is required"));
    }

    #[test]
    fn test_validation_http_store_requires_hosts() {
        let mut cfg = valid_config();
        cfg.store.backend = StoreBackendKind::Http;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("store.hosts"));
    }

    #[test]
    fn test_validation_sentinel_requires_sentinels() {
        let mut cfg = valid_config();
        cfg.cache.backend = CacheBackendKind::Redis;
        cfg.cache.redis.sentinel = Some(SentinelConfig {
            name: "meterd".to_string(),
            sentinels: Vec::new(),
            password: String::new(),
            sentinel_password: String::new(),
        });
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("sentinels is required"));
    }

    #[test]
    fn test_validation_thresholds_ordered() {
        let mut cfg = valid_config();
        cfg.disk_usage.warn_threshold = 0.99;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must not exceed"));
    }

    #[test]
    fn test_validation_disk_usage_requires_path() {
        let mut cfg = valid_config();
        cfg.tasks.disk_usage.enabled = true;
        cfg.disk_usage.hard_limit = Some("1GB".to_string());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("disk_usage.path"));

        cfg.disk_usage.manual = Some(ManualOverride::Unlock);
        cfg.validate().expect("manual override needs no path");
    }

    #[test]
    fn test_validation_zero_interval() {
        let mut cfg = valid_config();
        cfg.tasks.checkpoint.schedule = Schedule::Every(Duration::ZERO);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("tasks.checkpoint.schedule"));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
node_id: node-a
cache:
  backend: redis
  shard_width: 5s
  redis:
    sentinel:
      name: primary
      sentinels:
        - host: 10.0.0.1
          port: 26379
tasks:
  snapshot:
    schedule: now
  repair:
    schedule: 2m
    lag: 10s
disk_usage:
  hard_limit: 2TiB
client:
  drain_delay: 500ms
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse yaml");
        cfg.validate().expect("valid");
        assert_eq!(cfg.cache.backend, CacheBackendKind::Redis);
        assert_eq!(cfg.cache.shard_width, Duration::from_secs(5));
        let sentinel = cfg.cache.redis.sentinel.as_ref().expect("sentinel");
        assert_eq!(sentinel.name, "primary");
        assert_eq!(sentinel.sentinels[0].port, 26379);
        assert_eq!(cfg.tasks.snapshot.schedule, Schedule::Now);
        assert_eq!(cfg.tasks.repair.schedule, Schedule::Every(Duration::from_secs(120)));
        assert_eq!(cfg.tasks.repair.lag, Some(Duration::from_secs(10)));
        // Unlisted tasks keep their defaults.
        assert_eq!(cfg.tasks.ingest.schedule, Schedule::Every(Duration::from_secs(5)));
        assert_eq!(
            cfg.disk_usage.hard_limit_bytes().expect("limit"),
            Some(2 * 1024u64.pow(4))
        );
        assert_eq!(cfg.client.drain_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("METERD_NODE_ID", "from-env"),
            ("METERD_CACHE_BACKEND", "redis"),
            ("METERD_REDIS_PORT", "7000"),
            ("METERD_STORE_HOSTS", "http://a:4802, http://b:4802"),
            ("METERD_DISK_USAGE_LEADER", "Yes"),
        ]
        .into_iter()
        .collect();

        let mut cfg = Config::default();
        cfg.apply_env_with(|k| vars.get(k).map(|v| v.to_string()))
            .expect("apply env");

        assert_eq!(cfg.node_id, "from-env");
        assert_eq!(cfg.cache.backend, CacheBackendKind::Redis);
        assert_eq!(cfg.cache.redis.port, 7000);
        assert_eq!(cfg.store.backend, StoreBackendKind::Http);
        assert_eq!(cfg.store.hosts, vec!["http://a:4802", "http://b:4802"]);
        assert!(cfg.disk_usage.leader);
    }

    #[test]
    fn test_env_override_invalid_port() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_env_with(|k| (k == "METERD_REDIS_PORT").then(|| "high".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("REDIS_PORT"));
    }

    #[test]
    fn test_truthy() {
        for v in ["true", "ON", "y", "1", "enabled"] {
            assert!(is_truthy(v), "{v} should be truthy");
        }
        for v in ["false", "0", "no", ""] {
            assert!(!is_truthy(v), "{v} should not be truthy");
        }
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").expect("bytes"), 512);
        assert_eq!(parse_size("512b").expect("bytes"), 512);
        assert_eq!(parse_size("10k").expect("k"), 10 * 1024);
        assert_eq!(parse_size("5GB").expect("GB"), 5 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1MiB").expect("MiB"), 1024 * 1024);
        assert_eq!(parse_size(" 3t ").expect("t"), 3 * 1024u64.pow(4));
        assert!(parse_size("GB").is_err());
        assert!(parse_size("5q").is_err());
        assert!(parse_size("5kx").is_err());
        assert!(parse_size("99999999e").is_err());
    }
}
