//! API server.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Server                              │
//! │  lifecycle: starting → alive → dying → dead (watch channel)  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  supervisor                                                  │
//! │   ├── accept loop ── JoinSet<connection task>                │
//! │   │                    ├── reader → task per request         │
//! │   │                    └── writer                            │
//! │   └── health check (store ping every interval)               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! `dead` is published only after the accept loop has drained every
//! connection task and the health check has exited.

pub mod codec;
pub mod conn;
pub mod envelope;
pub mod facade;
pub mod facades;
pub mod limiter;
pub mod notifier;

pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_BYTES};
pub use envelope::{Request, ServerFrame, WireError};
pub use facade::{Authenticator, CallContext, Facade, Registry};
pub use limiter::{LoginLimiter, DEFAULT_LOGIN_RATE_LIMIT};

use crate::core::config::ServerConfig;
use crate::core::error::{KeelError, KeelResult};
use crate::net::tcp::{MetricsSnapshot, ServerMetrics, TcpListener};
use crate::net::tls;
use crate::state::State;
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_rustls::TlsAcceptor;

/// Default store health check interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Server lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Alive,
    Dying,
    Dead,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Alive => "alive",
            Self::Dying => "dying",
            Self::Dead => "dead",
        }
    }

    /// Dying or dead.
    pub fn is_stopping(self) -> bool {
        matches!(self, Self::Dying | Self::Dead)
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server start options.
#[derive(Clone)]
pub struct ServerOptions {
    pub bind: SocketAddr,
    pub login_rate_limit: usize,
    pub ping_interval: Duration,
    pub max_frame_bytes: usize,
    /// Defaults to the server's [`State`].
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            login_rate_limit: DEFAULT_LOGIN_RATE_LIMIT,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            authenticator: None,
        }
    }
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("bind", &self.bind)
            .field("login_rate_limit", &self.login_rate_limit)
            .field("ping_interval", &self.ping_interval)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("authenticator", &self.authenticator.is_some())
            .finish()
    }
}

impl ServerOptions {
    pub fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        Ok(Self {
            bind: config.bind_addr()?,
            login_rate_limit: config.login_rate_limit,
            ping_interval: config.ping_interval(),
            max_frame_bytes: config.max_frame_bytes,
            authenticator: None,
        })
    }
}

/// State shared by the server's tasks.
pub(crate) struct Shared {
    pub(crate) state: State,
    pub(crate) registry: Registry,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) limiter: LoginLimiter,
    pub(crate) metrics: Arc<ServerMetrics>,
    pub(crate) codec: FrameCodec,
    env_uuid: OnceLock<String>,
    lifecycle: watch::Sender<Lifecycle>,
    cause: Mutex<Option<KeelError>>,
}

impl Shared {
    pub(crate) fn subscribe(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    fn kill(&self, cause: Option<KeelError>) {
        if let Some(err) = cause {
            let mut slot = self.cause.lock();
            if slot.is_none() {
                tracing::warn!(error = %err, "API server killed");
                *slot = Some(err);
            }
        }
        self.lifecycle.send_if_modified(|state| {
            if matches!(state, Lifecycle::Starting | Lifecycle::Alive) {
                *state = Lifecycle::Dying;
                true
            } else {
                false
            }
        });
        // Logins already holding a permit finish; waiters fail.
        self.limiter.close();
    }

    /// The served environment's uuid, read from the store on first use.
    fn env_uuid(&self) -> KeelResult<&str> {
        if let Some(uuid) = self.env_uuid.get() {
            return Ok(uuid);
        }
        let uuid = self.state.environment()?.uuid().to_string();
        Ok(self.env_uuid.get_or_init(|| uuid))
    }

    /// A non-empty request scope must name the served environment.
    pub(crate) fn check_scope(&self, scope: &str) -> KeelResult<()> {
        let unknown = || KeelError::UnknownScope {
            scope: scope.to_string(),
        };
        match self.env_uuid() {
            Ok(uuid) if uuid == scope => Ok(()),
            Ok(_) => Err(unknown()),
            Err(e) if e.is_not_found() => Err(unknown()),
            Err(e) => Err(e),
        }
    }
}

/// Resolves once the lifecycle is dying or dead.
pub(crate) async fn until_dying(lifecycle: &mut watch::Receiver<Lifecycle>) {
    let _ = lifecycle.wait_for(|state| state.is_stopping()).await;
}

/// A running API server.
pub struct Server {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl Server {
    /// Bind, build the TLS config and start serving.
    ///
    /// Returns once the server is alive. Fails on bind errors or an invalid
    /// certificate or key.
    pub async fn start(
        opts: ServerOptions,
        cert_pem: &[u8],
        key_pem: &[u8],
        state: State,
        registry: Registry,
    ) -> KeelResult<Self> {
        let tls_config = tls::server_config(cert_pem, key_pem)?;
        let metrics = Arc::new(ServerMetrics::default());
        let listener = TcpListener::bind(opts.bind, metrics.clone()).await?;
        let local_addr = listener.local_addr()?;

        let (lifecycle, _) = watch::channel(Lifecycle::Starting);
        let authenticator = opts
            .authenticator
            .clone()
            .unwrap_or_else(|| Arc::new(state.clone()));
        let shared = Arc::new(Shared {
            state,
            registry,
            authenticator,
            limiter: LoginLimiter::new(opts.login_rate_limit),
            metrics,
            codec: FrameCodec::new(opts.max_frame_bytes),
            env_uuid: OnceLock::new(),
            lifecycle,
            cause: Mutex::new(None),
        });

        let mut started = shared.subscribe();
        let supervisor = tokio::spawn(supervise(
            shared.clone(),
            listener,
            TlsAcceptor::from(tls_config),
            opts.ping_interval,
        ));
        let _ = started
            .wait_for(|state| *state != Lifecycle::Starting)
            .await;

        tracing::info!(addr = %local_addr, "API server started");
        Ok(Self {
            shared,
            local_addr,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.shared.lifecycle.borrow()
    }

    pub fn is_dead(&self) -> bool {
        self.lifecycle() == Lifecycle::Dead
    }

    /// Resolves once the server is dead. Obtaining it does not block.
    pub fn dead(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut lifecycle = self.shared.subscribe();
        async move {
            let _ = lifecycle.wait_for(|state| *state == Lifecycle::Dead).await;
        }
    }

    /// Start dying. The first non-`None` cause is kept as the terminal error.
    pub fn kill(&self, cause: Option<KeelError>) {
        self.shared.kill(cause);
    }

    /// Wait until dead and return the terminal cause.
    pub async fn wait(&self) -> KeelResult<()> {
        self.dead().await;
        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        match self.shared.cause.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Kill without a cause and wait for the drain to finish.
    pub async fn stop(&self) -> KeelResult<()> {
        self.kill(None);
        self.wait().await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn limiter(&self) -> &LoginLimiter {
        &self.shared.limiter
    }
}

async fn supervise(
    shared: Arc<Shared>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ping_interval: Duration,
) {
    let accept = tokio::spawn(accept_loop(shared.clone(), listener, acceptor));
    let health = tokio::spawn(health_check(shared.clone(), ping_interval));
    shared.lifecycle.send_if_modified(|state| {
        if *state == Lifecycle::Starting {
            *state = Lifecycle::Alive;
            true
        } else {
            false
        }
    });

    for (name, task) in [("accept loop", accept), ("health check", health)] {
        if let Err(e) = task.await {
            tracing::error!(task = name, error = %e, "API server task failed");
            shared.kill(Some(KeelError::internal(format!("{} failed: {}", name, e))));
        }
    }

    shared.lifecycle.send_replace(Lifecycle::Dead);
    tracing::info!("API server stopped");
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, acceptor: TlsAcceptor) {
    let mut lifecycle = shared.subscribe();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = until_dying(&mut lifecycle) => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    tracing::debug!(conn = %conn.id, remote = %conn.remote_addr, "connection accepted");
                    connections.spawn(conn::serve(shared.clone(), conn, acceptor.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(done) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = done {
                    tracing::error!(error = %e, "connection task failed");
                }
            }
        }
    }

    drop(listener);
    tracing::debug!(connections = connections.len(), "listener closed, draining connections");
    while let Some(done) = connections.join_next().await {
        if let Err(e) = done {
            tracing::error!(error = %e, "connection task failed");
        }
    }
}

async fn health_check(shared: Arc<Shared>, interval: Duration) {
    let mut lifecycle = shared.subscribe();
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = until_dying(&mut lifecycle) => return,
            _ = ticker.tick() => {}
        }
        if let Err(e) = shared.state.ping() {
            tracing::error!(error = %e, "store health check failed");
            let cause = match e {
                KeelError::StoreUnavailable { .. } => e,
                other => KeelError::store_unavailable(other.to_string()),
            };
            shared.kill(Some(cause));
            return;
        }
    }
}
