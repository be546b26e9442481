//! TLS configuration.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TLS Configuration                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │   TlsIdentity     - Certificate chain + key (PEM)           │
//! │   server_config   - rustls ServerConfig for the API server  │
//! │   client_config   - rustls ClientConfig trusting a CA       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both sides use the ring crypto provider and the safe default protocol
//! versions (TLS 1.2 and 1.3).

use crate::core::error::{KeelError, KeelResult};
use anyhow::{Context, Result};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::path::Path;
use std::sync::Arc;

/// Loaded TLS identity (certificate chain + private key).
#[derive(Clone)]
pub struct TlsIdentity {
    /// Certificate chain in PEM format.
    pub cert_chain_pem: Vec<u8>,
    /// Private key in PEM format.
    pub key_pem: Vec<u8>,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("cert_chain_pem", &format_args!("{} bytes", self.cert_chain_pem.len()))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl TlsIdentity {
    pub fn from_pem(cert_chain_pem: impl Into<Vec<u8>>, key_pem: impl Into<Vec<u8>>) -> Self {
        Self {
            cert_chain_pem: cert_chain_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    /// Load a TLS identity from file paths.
    pub fn load(cert_chain_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_chain_pem = std::fs::read(cert_chain_path).with_context(|| {
            format!("failed to read cert chain: {}", cert_chain_path.display())
        })?;
        let key_pem = std::fs::read(key_path)
            .with_context(|| format!("failed to read private key: {}", key_path.display()))?;
        Ok(Self {
            cert_chain_pem,
            key_pem,
        })
    }

    /// Build the server configuration for this identity.
    pub fn server_config(&self) -> KeelResult<Arc<rustls::ServerConfig>> {
        server_config(&self.cert_chain_pem, &self.key_pem)
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(what: &str, err: impl std::fmt::Display) -> KeelError {
    KeelError::invalid(format!("{}: {}", what, err))
}

/// Parse every certificate in a PEM bundle.
pub fn parse_certs(pem: &[u8]) -> KeelResult<Vec<CertificateDer<'static>>> {
    let mut reader = pem;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error("invalid certificate PEM", e))?;
    if certs.is_empty() {
        return Err(KeelError::invalid("no certificates found in PEM"));
    }
    Ok(certs)
}

/// Parse the first private key in a PEM bundle.
pub fn parse_private_key(pem: &[u8]) -> KeelResult<PrivateKeyDer<'static>> {
    let mut reader = pem;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_error("invalid private key PEM", e))?
        .ok_or_else(|| KeelError::invalid("no private key found in PEM"))
}

/// Server configuration without client authentication.
pub fn server_config(cert_chain_pem: &[u8], key_pem: &[u8]) -> KeelResult<Arc<rustls::ServerConfig>> {
    let certs = parse_certs(cert_chain_pem)?;
    let key = parse_private_key(key_pem)?;
    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error("unsupported TLS protocol versions", e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| tls_error("certificate does not match private key", e))?;
    Ok(Arc::new(config))
}

/// Client configuration trusting the certificates in `ca_pem`.
pub fn client_config(ca_pem: &[u8]) -> KeelResult<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in parse_certs(ca_pem)? {
        roots
            .add(cert)
            .map_err(|e| tls_error("invalid CA certificate", e))?;
    }
    let config = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error("unsupported TLS protocol versions", e))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Server name used for SNI and certificate verification.
pub fn server_name(host: &str) -> KeelResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| tls_error(&format!("invalid server name {:?}", host), e))
}
