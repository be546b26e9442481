//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: store → state (bootstrap on first start) → API server
//! - Shutdown order: API server (drains connections) → store

use crate::apiserver::{Registry, Server, ServerOptions};
use crate::core::config::Config;
use crate::net::tls::TlsIdentity;
use crate::state::{State, StateOptions};
use crate::store::{JournalStore, MemoryStore, Store};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

/// Keel runtime holding all component handles.
pub struct Runtime {
    /// Configuration.
    config: Arc<Config>,

    /// Environment state, once opened.
    state: Option<State>,

    /// Running API server.
    server: Option<Server>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            state: None,
            server: None,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the environment state (if started).
    pub fn state(&self) -> Option<&State> {
        self.state.as_ref()
    }

    /// Get the API server (if started).
    pub fn server(&self) -> Option<&Server> {
        self.server.as_ref()
    }

    /// Address the API server is listening on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(Server::local_addr)
    }

    /// Check if the API server is up.
    pub fn is_running(&self) -> bool {
        self.server.as_ref().is_some_and(|server| !server.is_dead())
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Open the store and state, then start the API server.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            environment = %self.config.environment.uuid,
            backend = %self.config.store.backend,
            "starting Keel runtime"
        );

        let store = self.open_store()?;
        let state = self.open_state(store)?;
        self.state = Some(state.clone());
        self.start_server(state).await?;

        tracing::info!("Keel runtime started");
        Ok(())
    }

    fn open_store(&self) -> Result<Arc<dyn Store>> {
        let store: Arc<dyn Store> = match self.config.store.backend.as_str() {
            "journal" => {
                let dir = Path::new(&self.config.store.data_dir);
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create data dir: {}", dir.display()))?;
                let journal = JournalStore::open(dir)?;
                tracing::info!(path = %journal.path().display(), "journal store opened");
                Arc::new(journal)
            }
            _ => {
                tracing::warn!("using in-memory store, state is lost on exit");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(store)
    }

    /// Open the environment, creating it and its administrator on first start.
    fn open_state(&self, store: Arc<dyn Store>) -> Result<State> {
        let env = &self.config.environment;
        let options = StateOptions {
            max_attempts: self.config.txn.max_attempts,
            ..StateOptions::default()
        };
        let state = State::open(store, env.uuid.clone(), options);

        match state.environment() {
            Ok(existing) => {
                tracing::info!(uuid = %existing.uuid(), name = %existing.name(), "environment loaded");
            }
            Err(e) if e.is_not_found() => {
                let password = env.admin_password.as_deref().with_context(|| {
                    format!(
                        "environment {} does not exist; environment.admin_password is required to create it",
                        env.uuid
                    )
                })?;
                state
                    .initialize(&env.name, &env.admin_user, password)
                    .context("failed to initialize environment")?;
            }
            Err(e) => return Err(e).context("failed to read environment"),
        }
        Ok(state)
    }

    async fn start_server(&mut self, state: State) -> Result<()> {
        let server_config = &self.config.server;
        let identity = TlsIdentity::load(
            Path::new(&server_config.tls_cert_path),
            Path::new(&server_config.tls_key_path),
        )?;
        let opts = ServerOptions::from_config(server_config)?;
        let server = Server::start(
            opts,
            &identity.cert_chain_pem,
            &identity.key_pem,
            state,
            Registry::with_default_facades(),
        )
        .await
        .context("failed to start API server")?;

        tracing::info!(addr = %server.local_addr(), "API server listening");
        self.server = Some(server);
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        self.shutdown_tx.send_replace(true);
    }

    /// Wait for shutdown signal.
    pub async fn wait_for_shutdown(&mut self) {
        let mut rx = self.shutdown_rx.clone();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Run the runtime until a signal, a shutdown request or a server failure.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let dead = match self.server.as_ref() {
            Some(server) => server.dead(),
            None => anyhow::bail!("API server not started"),
        };
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = shutdown_rx.wait_for(|stop| *stop) => {
                tracing::info!("shutdown requested by component");
            }
            _ = dead => {
                tracing::error!("API server died");
            }
        }

        self.stop().await
    }

    /// Stop the API server and wait for it to drain.
    ///
    /// Returns the error that killed the server, if any.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping Keel runtime");
        self.shutdown_tx.send_replace(true);

        if let Some(server) = self.server.take() {
            server.stop().await.context("API server failed")?;
        }
        if let Some(state) = self.state.take() {
            let stats = state.txn_stats();
            tracing::info!(
                commits = stats.commits,
                aborts = stats.aborts,
                "Keel runtime stopped"
            );
        }
        Ok(())
    }
}
