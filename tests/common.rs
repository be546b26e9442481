//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use keel::apiserver::facade::{AuthFuture, Authenticator};
use keel::apiserver::{Registry, Server, ServerOptions};
use keel::client::Client;
use keel::core::config::Config;
use keel::state::{Principal, State, StateOptions};
use keel::store::{MemoryStore, Store};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

pub const ENV_UUID: &str = "deadbeef-0bad-400d-8000-4b1d0d06f00d";
pub const ADMIN_PASSWORD: &str = "admin-secret";
pub const UNIT_PASSWORD: &str = "unit-secret";

/// Self-signed certificate for `localhost`.
pub struct TestCerts {
    pub cert_pem: String,
    pub key_pem: String,
}

impl TestCerts {
    pub fn generate() -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("Failed to generate certificate");
        Self {
            cert_pem: cert.serialize_pem().expect("Failed to serialize certificate"),
            key_pem: cert.serialize_private_key_pem(),
        }
    }

    /// Write the certificate and key to temp files.
    pub fn write(&self) -> (NamedTempFile, NamedTempFile) {
        let mut cert = NamedTempFile::new().expect("Failed to create temp file");
        cert.write_all(self.cert_pem.as_bytes())
            .expect("Failed to write certificate");
        let mut key = NamedTempFile::new().expect("Failed to create temp file");
        key.write_all(self.key_pem.as_bytes())
            .expect("Failed to write key");
        (cert, key)
    }
}

/// An initialised environment over the given store with service
/// `wordpress` and unit `wordpress/0` (password [`UNIT_PASSWORD`]).
pub fn populated_state(store: Arc<dyn Store>) -> State {
    let st = State::open(store, ENV_UUID, StateOptions::default());
    st.initialize("testenv", "admin", ADMIN_PASSWORD)
        .expect("Failed to initialize environment");
    let mut svc = st
        .add_service("wordpress", "cs:wordpress-1", &["db".to_string()])
        .expect("Failed to add service");
    let mut unit = svc.add_unit().expect("Failed to add unit");
    unit.set_password(UNIT_PASSWORD)
        .expect("Failed to set unit password");
    st
}

/// [`populated_state`] over a fresh in-memory store.
pub fn memory_state() -> (Arc<MemoryStore>, State) {
    let store = Arc::new(MemoryStore::new());
    let st = populated_state(store.clone());
    (store, st)
}

/// Options for a test server: ephemeral port, quick health checks.
pub fn test_options() -> ServerOptions {
    ServerOptions {
        ping_interval: Duration::from_millis(20),
        ..ServerOptions::default()
    }
}

pub async fn start_server(st: &State, opts: ServerOptions, certs: &TestCerts) -> Server {
    Server::start(
        opts,
        certs.cert_pem.as_bytes(),
        certs.key_pem.as_bytes(),
        st.clone(),
        Registry::with_default_facades(),
    )
    .await
    .expect("Failed to start server")
}

pub async fn connect(server: &Server, certs: &TestCerts) -> Client {
    Client::connect(server.local_addr(), "localhost", certs.cert_pem.as_bytes())
        .await
        .expect("Failed to connect")
}

pub async fn admin_client(server: &Server, certs: &TestCerts) -> Client {
    let client = connect(server, certs).await;
    client
        .login("user-admin", ADMIN_PASSWORD)
        .await
        .expect("Failed to log in");
    client
}

/// Delegates to the state after a delay, so logins pile up.
pub struct SlowAuthenticator {
    pub state: State,
    pub delay: Duration,
}

impl Authenticator for SlowAuthenticator {
    fn authenticate<'a>(&'a self, auth_tag: &'a str, password: &'a str) -> AuthFuture<'a> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.state.authenticate(auth_tag, password)
        })
    }
}

/// Holds every login until released.
pub struct GatedAuthenticator {
    pub state: State,
    pub gate: tokio::sync::Semaphore,
}

impl Authenticator for GatedAuthenticator {
    fn authenticate<'a>(&'a self, auth_tag: &'a str, password: &'a str) -> AuthFuture<'a> {
        Box::pin(async move {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| keel::KeelError::ShuttingDown)?;
            self.state.authenticate(auth_tag, password)
        })
    }
}

/// Minimal config text pointing at the given TLS files.
pub fn config_toml(cert_path: &str, key_path: &str, extra: &str) -> String {
    format!(
        r#"
[server]
bind = "127.0.0.1:0"
tls_cert_path = "{}"
tls_key_path = "{}"
ping_interval_ms = 50

[environment]
uuid = "{}"
admin_password = "{}"
{}
"#,
        cert_path, key_path, ENV_UUID, ADMIN_PASSWORD, extra
    )
}

pub fn load_config(content: &str) -> Config {
    Config::from_toml(content).expect("Failed to load config")
}

/// Principal for a user tag.
pub fn user(name: &str) -> Principal {
    Principal {
        tag: keel::state::Tag::User(name.to_string()),
    }
}

/// Poll `check` until it holds or the timeout passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
