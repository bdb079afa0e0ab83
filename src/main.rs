use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use meterd::client::adjust::{push_adjustment, Adjustment};
use meterd::client::MeterClient;
use meterd::config::{ClientConfig, Config, ManualOverride};
use meterd::daemon::Daemon;

/// Storage usage metering daemon.
#[derive(Parser)]
#[command(name = "meterd", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Run a single task once and exit.
    RunTask {
        /// One of ingest, checkpoint, snapshot, repair, disk_usage.
        name: String,
    },
    /// Lock the durable store for writes.
    Lock,
    /// Unlock the durable store for writes.
    Unlock,
    /// Correct stored totals for buckets, accounts or users.
    Adjust {
        /// Ingestion endpoint to push the correction to.
        #[arg(long, default_value = "http://localhost:8100")]
        endpoint: String,
        /// Target bucket (repeatable).
        #[arg(short, long = "bucket")]
        buckets: Vec<String>,
        /// Target account (repeatable).
        #[arg(short, long = "account")]
        accounts: Vec<String>,
        /// Target user (repeatable).
        #[arg(short, long = "user")]
        users: Vec<String>,
        /// Adjust numberOfObjects by this amount.
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        objects: i64,
        /// Adjust storageUtilized by this many bytes.
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        storage: i64,
    },
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    fmt().with_env_filter(filter).with_target(true).init();
    Ok(())
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Version) => {
            println!("meterd {}", version::full());
            return Ok(());
        }
        Some(Command::Adjust {
            endpoint,
            buckets,
            accounts,
            users,
            objects,
            storage,
        }) => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"))?;
            let adjustment = Adjustment {
                buckets,
                accounts,
                users,
                object_delta: objects,
                size_delta: storage,
            };
            adjustment.validate()?;
            let client = MeterClient::new(&ClientConfig {
                endpoint,
                disable_retry_cache: true,
                ..ClientConfig::default()
            })?;
            return build_runtime()?.block_on(async {
                push_adjustment(&client, &adjustment).await.map(|_| ())
            });
        }
        _ => {}
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let level = cli.log_level.unwrap_or_else(|| cfg.log_level.clone());
    init_logging(&level)?;

    let rt = build_runtime()?;

    match cli.command {
        None | Some(Command::Version) | Some(Command::Adjust { .. }) => {
            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                node = %cfg.node_id,
                "starting meterd",
            );
            rt.block_on(run(cfg))
        }
        Some(Command::RunTask { name }) => rt.block_on(async {
            Daemon::new(cfg)?.run_task(&name, None).await
        }),
        Some(Command::Lock) => rt.block_on(async {
            Daemon::new(cfg)?
                .run_task("disk_usage", Some(ManualOverride::Lock))
                .await
        }),
        Some(Command::Unlock) => rt.block_on(async {
            Daemon::new(cfg)?
                .run_task("disk_usage", Some(ManualOverride::Unlock))
                .await
        }),
    }
}

async fn shutdown_signal() {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                None
            }
        };

    let term = async {
        match &mut sigterm {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = term => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    let mut daemon = Daemon::new(cfg)?;
    daemon.start().await?;

    let _ = shutdown_rx.await;

    daemon.stop().await?;

    tracing::info!("meterd stopped");

    Ok(())
}
