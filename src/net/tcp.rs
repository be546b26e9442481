//! TCP listener abstraction.
//!
//! Wraps the tokio listener with server-owned connection ids and the
//! connection/request counters the API server reports.

use crate::core::error::{KeelError, KeelResult};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};

/// Connection identifier. Ids start at 1 and are never reused by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Accepted TCP connection with metadata.
pub struct TcpConnection {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    stream: TcpStream,
    pub created_at: Instant,
}

impl TcpConnection {
    pub fn new(id: ConnectionId, stream: TcpStream, remote_addr: SocketAddr) -> Self {
        Self {
            id,
            remote_addr,
            stream,
            created_at: Instant::now(),
        }
    }

    /// Take the underlying stream.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// Server connection and request counters.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Total connections accepted.
    pub connections_total: AtomicU64,
    /// Currently open connections.
    pub connections_active: AtomicU64,
    /// Requests received.
    pub requests_total: AtomicU64,
    /// Requests answered with an error.
    pub requests_failed: AtomicU64,
    /// Logins holding a limiter permit.
    pub logins_in_flight: AtomicU64,
}

/// Point-in-time copy of [`ServerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub requests_total: u64,
    pub requests_failed: u64,
    pub logins_in_flight: u64,
}

impl ServerMetrics {
    pub fn connection_accepted(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_received(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn login_started(&self) {
        self.logins_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn login_finished(&self) {
        self.logins_in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            logins_in_flight: self.logins_in_flight.load(Ordering::Relaxed),
        }
    }
}

/// TCP listener assigning connection ids.
pub struct TcpListener {
    inner: TokioTcpListener,
    next_conn_id: AtomicU64,
    metrics: Arc<ServerMetrics>,
}

impl TcpListener {
    /// Bind and start listening.
    pub async fn bind(addr: SocketAddr, metrics: Arc<ServerMetrics>) -> KeelResult<Self> {
        let inner = TokioTcpListener::bind(addr)
            .await
            .map_err(|e| KeelError::transport(format!("failed to bind to {}: {}", addr, e)))?;
        Ok(Self {
            inner,
            next_conn_id: AtomicU64::new(1),
            metrics,
        })
    }

    pub fn local_addr(&self) -> KeelResult<SocketAddr> {
        self.inner
            .local_addr()
            .map_err(|e| KeelError::transport(format!("no local address: {}", e)))
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Accept one connection. Cancel safe.
    pub async fn accept(&self) -> KeelResult<TcpConnection> {
        let (stream, addr) = self
            .inner
            .accept()
            .await
            .map_err(|e| KeelError::transport(format!("accept failed: {}", e)))?;
        let _ = stream.set_nodelay(true);
        let id = self.next_connection_id();
        self.metrics.connection_accepted();
        Ok(TcpConnection::new(id, stream, addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        assert_eq!(format!("{}", ConnectionId(42)), "conn-42");
    }

    #[test]
    fn test_server_metrics() {
        let metrics = ServerMetrics::default();
        metrics.connection_accepted();
        metrics.connection_accepted();
        metrics.connection_closed();
        metrics.request_received();
        metrics.request_failed();
        metrics.login_started();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_total, 2);
        assert_eq!(snap.connections_active, 1);
        assert_eq!(snap.requests_total, 1);
        assert_eq!(snap.requests_failed, 1);
        assert_eq!(snap.logins_in_flight, 1);

        metrics.login_finished();
        assert_eq!(metrics.snapshot().logins_in_flight, 0);
    }

    #[tokio::test]
    async fn test_accept_assigns_increasing_ids() {
        let metrics = Arc::new(ServerMetrics::default());
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap(), metrics.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.port() > 0);

        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        let first = listener.accept().await.unwrap();
        let second = listener.accept().await.unwrap();
        assert_eq!(first.id, ConnectionId(1));
        assert_eq!(second.id, ConnectionId(2));
        assert_eq!(metrics.active_connections(), 2);
    }

    #[tokio::test]
    async fn test_bind_in_use_fails() {
        let metrics = Arc::new(ServerMetrics::default());
        let first = TcpListener::bind("127.0.0.1:0".parse().unwrap(), metrics.clone())
            .await
            .unwrap();
        let addr = first.local_addr().unwrap();
        let err = TcpListener::bind(addr, metrics).await.err().unwrap();
        assert!(matches!(err, KeelError::Transport { .. }));
    }
}
