//! Resilient wrapper around a single key/value backend connection.
//!
//! Every component that touches shared state goes through
//! [`ResilientClient::call`], which waits (with exponential backoff, up to a
//! deadline) for the connection to be ready, and applies a command timeout
//! when the backend runs behind a failover-capable topology.

pub mod redis;

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwapOption;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::health::HealthMetrics;

/// Errors surfaced by [`ResilientClient::call`].
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend unavailable after waiting {waited:?}")]
    Unavailable { waited: Duration },

    #[error("backend operation timed out after {timeout:?}")]
    OperationTimedOut { timeout: Duration },

    #[error("backend command failed: {0:#}")]
    Command(anyhow::Error),
}

/// Connection readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Ready = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Ready,
            _ => Self::Disconnected,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ready => "ready",
        }
    }
}

/// Opens and checks connections for one backend technology.
pub trait Connector: Send + Sync + 'static {
    type Conn: Clone + Send + Sync + 'static;

    /// Backend name for logs and metric labels.
    fn name(&self) -> &'static str;

    /// Establish a transport connection.
    fn connect(&self) -> impl Future<Output = Result<Self::Conn>> + Send;

    /// Round-trip check that the connection serves commands.
    fn ping(&self, conn: &Self::Conn) -> impl Future<Output = Result<()>> + Send;

    /// Whether the topology can fail over (sentinel style). Enables command timeouts.
    fn is_failover(&self) -> bool;

    /// Whether a command error means the connection itself is gone.
    fn is_connection_error(&self, _err: &anyhow::Error) -> bool {
        false
    }
}

/// Timing knobs for [`ResilientClient`].
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    /// Per-command timeout, only applied with failover topologies.
    pub command_timeout: Duration,
    /// Window for a connection attempt to reach ready; also the probe interval.
    pub connect_timeout: Duration,
    /// How long a call waits for readiness before failing.
    pub retry_deadline: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            retry_deadline: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Shared, cloneable handle to a resilient backend connection.
pub struct ResilientClient<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ResilientClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C: Connector> {
    connector: C,
    opts: ClientOptions,
    conn: ArcSwapOption<C::Conn>,
    state: AtomicU8,
    /// Bumped on every connection attempt; stale attempts are discarded.
    generation: AtomicU64,
    metrics: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
    probe: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> ResilientClient<C> {
    pub fn new(connector: C, opts: ClientOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                opts,
                conn: ArcSwapOption::empty(),
                state: AtomicU8::new(ConnState::Disconnected as u8),
                generation: AtomicU64::new(0),
                metrics: None,
                cancel: CancellationToken::new(),
                probe: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Record connection state and reconnects in `metrics`.
    ///
    /// Must be called before the client is cloned.
    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.metrics = Some(metrics);
        }
        self
    }

    pub fn state(&self) -> ConnState {
        self.inner.state()
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Connect and start the background probe.
    pub fn start(&self) {
        let mut slot = self.inner.probe.lock();
        if slot.is_some() {
            return;
        }

        Inner::begin_connect(&self.inner);

        let inner = Arc::clone(&self.inner);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                Instant::now() + inner.opts.connect_timeout,
                inner.opts.connect_timeout,
            );
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    _ = ticker.tick() => Inner::probe_once(&inner).await,
                }
            }
        }));

        info!(backend = self.inner.connector.name(), "backend client started");
    }

    /// Run `op` against the live connection.
    ///
    /// Waits for readiness with exponential backoff until the retry deadline.
    /// With a failover topology the command races a timer; on timeout the
    /// connection is re-initialized and the call fails.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, BackendError>
    where
        F: FnOnce(C::Conn) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let conn = self.wait_ready().await?;
        let inner = &self.inner;

        let result = if inner.connector.is_failover() {
            let timeout = inner.opts.command_timeout;
            match tokio::time::timeout(timeout, op(conn)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        backend = inner.connector.name(),
                        ?timeout,
                        "backend command timed out, reinitializing connection",
                    );
                    Inner::force_reconnect(inner);
                    return Err(BackendError::OperationTimedOut { timeout });
                }
            }
        } else {
            op(conn).await
        };

        result.map_err(|e| {
            if inner.connector.is_connection_error(&e) {
                warn!(backend = inner.connector.name(), error = %e, "backend connection lost");
                Inner::force_reconnect(inner);
            }
            BackendError::Command(e)
        })
    }

    /// Drop the connection and make the next call connect again.
    pub fn reinit(&self) {
        Inner::force_reconnect(&self.inner);
    }

    /// Stop the probe and release the connection.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();

        let handle = self.inner.probe.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.conn.store(None);
        self.inner.set_state(ConnState::Disconnected);
        debug!(backend = self.inner.connector.name(), "backend client stopped");
    }

    async fn wait_ready(&self) -> Result<C::Conn, BackendError> {
        let inner = &self.inner;
        let started = Instant::now();
        let mut backoff = inner.opts.initial_backoff;

        loop {
            if inner.state() == ConnState::Ready {
                if let Some(conn) = inner.conn.load_full() {
                    return Ok(conn.as_ref().clone());
                }
            }

            let waited = started.elapsed();
            if waited >= inner.opts.retry_deadline {
                return Err(BackendError::Unavailable { waited });
            }

            if !inner.cancel.is_cancelled() {
                Inner::begin_connect(inner);
            }

            let remaining = inner.opts.retry_deadline - waited;
            tokio::time::sleep(backoff.min(remaining)).await;
            backoff = (backoff * 2).min(inner.opts.max_backoff);
        }
    }
}

impl<C: Connector> Inner<C> {
    fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::SeqCst);
        if let Some(m) = &self.metrics {
            m.backend_state
                .with_label_values(&[self.connector.name()])
                .set(f64::from(state as u8));
        }
    }

    /// Start a connection attempt if none is in progress.
    fn begin_connect(this: &Arc<Self>) {
        if this
            .state
            .compare_exchange(
                ConnState::Disconnected as u8,
                ConnState::Connecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        this.set_state(ConnState::Connecting);

        let generation = this.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(m) = &this.metrics {
            m.backend_reconnects
                .with_label_values(&[this.connector.name()])
                .inc();
        }

        let inner = Arc::clone(this);
        tokio::spawn(async move {
            inner.connect_attempt(generation).await;
        });
    }

    /// One attempt that must reach ready within the connect window.
    async fn connect_attempt(&self, generation: u64) {
        let window = self.opts.connect_timeout;
        let name = self.connector.name();

        let attempt = async {
            let conn = self.connector.connect().await?;
            if self.is_current(generation) {
                self.set_state(ConnState::Connected);
            }
            self.connector.ping(&conn).await?;
            Ok::<_, anyhow::Error>(conn)
        };

        let outcome = tokio::time::timeout(window, attempt).await;

        if !self.is_current(generation) {
            debug!(backend = name, generation, "discarding stale connection attempt");
            return;
        }

        match outcome {
            Ok(Ok(conn)) => {
                self.conn.store(Some(Arc::new(conn)));
                self.set_state(ConnState::Ready);
                info!(backend = name, "backend connection ready");
            }
            Ok(Err(e)) => {
                self.conn.store(None);
                self.set_state(ConnState::Disconnected);
                warn!(backend = name, error = %e, "backend connection failed");
            }
            Err(_) => {
                self.conn.store(None);
                self.set_state(ConnState::Disconnected);
                warn!(backend = name, ?window, "backend connection not ready in time");
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Discard the current connection and start a fresh attempt.
    fn force_reconnect(this: &Arc<Self>) {
        this.generation.fetch_add(1, Ordering::SeqCst);
        this.conn.store(None);
        this.set_state(ConnState::Disconnected);
        if !this.cancel.is_cancelled() {
            Self::begin_connect(this);
        }
    }

    async fn probe_once(this: &Arc<Self>) {
        match this.state() {
            ConnState::Ready => {
                let Some(conn) = this.conn.load_full() else {
                    Self::force_reconnect(this);
                    return;
                };

                let ping = tokio::time::timeout(
                    this.opts.connect_timeout,
                    this.connector.ping(conn.as_ref()),
                )
                .await;

                match ping {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(backend = this.connector.name(), error = %e, "backend probe failed");
                        Self::force_reconnect(this);
                    }
                    Err(_) => {
                        warn!(backend = this.connector.name(), "backend probe timed out");
                        Self::force_reconnect(this);
                    }
                }
            }
            ConnState::Disconnected => Self::begin_connect(this),
            // Attempts in flight are bounded by the connect window.
            ConnState::Connecting | ConnState::Connected => {}
        }
    }
}
