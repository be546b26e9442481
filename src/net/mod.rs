//! Networking layer.
//!
//! - [`tls`] - TLS identity loading and rustls configuration
//! - [`tcp`] - TCP listener with connection ids and server metrics

pub mod tcp;
pub mod tls;
