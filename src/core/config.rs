//! Configuration parsing and validation.
//!
//! Keel configuration is loaded from TOML files with CLI overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level Keel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// API server configuration.
    pub server: ServerConfig,

    /// Document store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Transaction engine configuration.
    #[serde(default)]
    pub txn: TxnConfig,

    /// Environment bootstrap settings.
    pub environment: EnvironmentConfig,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:17070").
    pub bind: String,

    /// TLS certificate chain path (PEM).
    pub tls_cert_path: String,

    /// TLS private key path (PEM).
    pub tls_key_path: String,

    /// Maximum number of login requests processed concurrently.
    #[serde(default = "default_login_rate_limit")]
    pub login_rate_limit: usize,

    /// Store health check interval in milliseconds.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Maximum frame size in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl ServerConfig {
    /// Parsed bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("invalid server bind address: {}", self.bind))
    }

    /// Health check interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// Document store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend: "memory" or "journal".
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Directory holding the journal (journal backend only).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            data_dir: default_data_dir(),
        }
    }
}

/// Transaction engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnConfig {
    /// Maximum build/commit attempts before reporting contention.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

/// Environment bootstrap settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Environment UUID served by this process.
    pub uuid: String,

    /// Human readable environment name.
    #[serde(default = "default_environment_name")]
    pub name: String,

    /// Administrator user created on first start.
    #[serde(default = "default_admin_user")]
    pub admin_user: String,

    /// Administrator password (only used when the user is first created).
    #[serde(default)]
    pub admin_password: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// CLI overrides applied on top of the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub bind: Option<String>,
    pub data_dir: Option<String>,
}

// Default value functions

fn default_login_rate_limit() -> usize {
    10
}

fn default_ping_interval_ms() -> u64 {
    10_000
}

fn default_max_frame_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_store_backend() -> String {
    "memory".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_environment_name() -> String {
    "default".to_string()
}

fn default_admin_user() -> String {
    "admin".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref bind) = overrides.bind {
            self.server.bind = bind.clone();
        }
        if let Some(ref data_dir) = overrides.data_dir {
            self.store.data_dir = data_dir.clone();
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_server()?;
        self.validate_store()?;
        self.validate_txn()?;
        self.validate_environment()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_server(&self) -> Result<()> {
        self.server.bind_addr()?;
        if self.server.login_rate_limit == 0 {
            anyhow::bail!("server.login_rate_limit must be > 0");
        }
        if self.server.ping_interval_ms == 0 {
            anyhow::bail!("server.ping_interval_ms must be > 0");
        }
        if self.server.max_frame_bytes < 1024 {
            anyhow::bail!(
                "server.max_frame_bytes must be at least 1024, got: {}",
                self.server.max_frame_bytes
            );
        }
        if self.server.tls_cert_path.is_empty() || self.server.tls_key_path.is_empty() {
            anyhow::bail!("server.tls_cert_path and server.tls_key_path are required");
        }
        Ok(())
    }

    fn validate_store(&self) -> Result<()> {
        if self.store.backend != "memory" && self.store.backend != "journal" {
            anyhow::bail!(
                "store.backend must be 'memory' or 'journal', got: {}",
                self.store.backend
            );
        }
        if self.store.backend == "journal" && self.store.data_dir.is_empty() {
            anyhow::bail!("store.data_dir required for journal backend");
        }
        Ok(())
    }

    fn validate_txn(&self) -> Result<()> {
        if self.txn.max_attempts == 0 {
            anyhow::bail!("txn.max_attempts must be > 0");
        }
        Ok(())
    }

    fn validate_environment(&self) -> Result<()> {
        if self.environment.uuid.is_empty() {
            anyhow::bail!("environment.uuid must not be empty");
        }
        if self.environment.uuid.contains(':') {
            anyhow::bail!("environment.uuid must not contain ':'");
        }
        if self.environment.admin_user.is_empty() {
            anyhow::bail!("environment.admin_user must not be empty");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        match self.telemetry.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => anyhow::bail!(
                "telemetry.log_level must be one of trace/debug/info/warn/error, got: {}",
                other
            ),
        }
    }
}
