use anyhow::{bail, Context, Result};
use redis::aio::MultiplexedConnection;
use tracing::debug;

use super::{ClientOptions, Connector, ResilientClient};
use crate::config::{RedisConfig, SentinelConfig};

/// Redis connector for a standalone server or a sentinel-managed master.
pub struct RedisConnector {
    cfg: RedisConfig,
}

impl RedisConnector {
    pub fn new(cfg: RedisConfig) -> Self {
        Self { cfg }
    }

    /// Build a resilient client using the timeouts from `cfg`.
    pub fn client(cfg: RedisConfig) -> ResilientClient<Self> {
        let opts = ClientOptions {
            command_timeout: cfg.command_timeout,
            connect_timeout: cfg.connect_timeout,
            retry_deadline: cfg.retry_deadline,
            ..Default::default()
        };
        ResilientClient::new(Self::new(cfg), opts)
    }

    fn connection_info(host: &str, port: u16, password: &str, db: i64) -> redis::ConnectionInfo {
        redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host.to_string(), port),
            redis: redis::RedisConnectionInfo {
                db,
                password: (!password.is_empty()).then(|| password.to_string()),
                ..Default::default()
            },
        }
    }

    /// Ask each sentinel in turn for the current master address.
    async fn resolve_master(sentinel: &SentinelConfig) -> Result<(String, u16)> {
        let mut last_err = None;

        for node in &sentinel.sentinels {
            let info =
                Self::connection_info(&node.host, node.port, &sentinel.sentinel_password, 0);

            let lookup = async {
                let client = redis::Client::open(info).context("building sentinel client")?;
                let mut conn = client
                    .get_multiplexed_async_connection()
                    .await
                    .context("connecting to sentinel")?;

                let addr: Option<(String, String)> = redis::cmd("SENTINEL")
                    .arg("get-master-addr-by-name")
                    .arg(&sentinel.name)
                    .query_async(&mut conn)
                    .await
                    .context("querying sentinel for master")?;

                let Some((host, port)) = addr else {
                    bail!("sentinel does not know master {}", sentinel.name);
                };
                let port: u16 = port
                    .parse()
                    .with_context(|| format!("invalid master port {port}"))?;
                Ok::<_, anyhow::Error>((host, port))
            };

            match lookup.await {
                Ok(addr) => {
                    debug!(
                        sentinel = %format!("{}:{}", node.host, node.port),
                        master = %format!("{}:{}", addr.0, addr.1),
                        "resolved redis master",
                    );
                    return Ok(addr);
                }
                Err(e) => last_err = Some(e),
            }
        }

        match last_err {
            Some(e) => Err(e.context(format!("no sentinel could resolve {}", sentinel.name))),
            None => bail!("no sentinels configured"),
        }
    }
}

impl Connector for RedisConnector {
    type Conn = MultiplexedConnection;

    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> Result<MultiplexedConnection> {
        let info = match &self.cfg.sentinel {
            Some(sentinel) => {
                let (host, port) = Self::resolve_master(sentinel).await?;
                Self::connection_info(&host, port, &sentinel.password, self.cfg.db)
            }
            None => Self::connection_info(
                &self.cfg.host,
                self.cfg.port,
                &self.cfg.password,
                self.cfg.db,
            ),
        };

        let client = redis::Client::open(info).context("building redis client")?;
        client
            .get_multiplexed_async_connection()
            .await
            .context("connecting to redis")
    }

    async fn ping(&self, conn: &MultiplexedConnection) -> Result<()> {
        let mut conn = conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("pinging redis")?;

        if pong != "PONG" {
            bail!("unexpected PING reply {pong:?}");
        }
        Ok(())
    }

    fn is_failover(&self) -> bool {
        self.cfg.sentinel.is_some()
    }

    fn is_connection_error(&self, err: &anyhow::Error) -> bool {
        err.chain()
            .filter_map(|cause| cause.downcast_ref::<redis::RedisError>())
            .any(|e| e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostPort;

    #[test]
    fn test_connection_info_password() {
        let info = RedisConnector::connection_info("cache", 6380, "secret", 2);
        assert_eq!(
            info.addr,
            redis::ConnectionAddr::Tcp("cache".to_string(), 6380)
        );
        assert_eq!(info.redis.db, 2);
        assert_eq!(info.redis.password.as_deref(), Some("secret"));

        let info = RedisConnector::connection_info("cache", 6380, "", 0);
        assert_eq!(info.redis.password, None);
    }

    #[test]
    fn test_failover_only_with_sentinel() {
        let mut cfg = RedisConfig::default();
        assert!(!RedisConnector::new(cfg.clone()).is_failover());

        cfg.sentinel = Some(SentinelConfig {
            name: "meterd".to_string(),
            sentinels: vec![HostPort {
                host: "127.0.0.1".to_string(),
                port: 26379,
            }],
            password: String::new(),
            sentinel_password: String::new(),
        });
        assert!(RedisConnector::new(cfg).is_failover());
    }

    #[test]
    fn test_connection_errors_detected() {
        let connector = RedisConnector::new(RedisConfig::default());
        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        let err = anyhow::Error::new(io).context("running command");
        assert!(connector.is_connection_error(&err));

        let other = anyhow::anyhow!("WRONGTYPE Operation against a key");
        assert!(!connector.is_connection_error(&other));
    }
}
