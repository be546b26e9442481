//! Per-connection request logging.

use super::envelope::Request;
use crate::core::error::KeelError;
use crate::net::tcp::ConnectionId;
use std::net::SocketAddr;
use std::time::Duration;

/// Logs the life of one connection and the requests it serves.
#[derive(Debug, Clone, Copy)]
pub struct RequestNotifier {
    conn_id: ConnectionId,
}

/// Pings are too frequent to log.
fn is_ping(req: &Request) -> bool {
    req.facade == "Pinger" && req.request == "Ping"
}

impl RequestNotifier {
    pub fn new(conn_id: ConnectionId) -> Self {
        Self { conn_id }
    }

    pub fn join(&self, remote: SocketAddr) {
        tracing::info!(conn = %self.conn_id, remote = %remote, "connection joined");
    }

    pub fn leave(&self, lifetime: Duration) {
        tracing::info!(conn = %self.conn_id, lifetime = ?lifetime, "connection left");
    }

    pub fn request(&self, principal: &str, req: &Request) {
        if is_ping(req) {
            return;
        }
        tracing::debug!(
            "[{}] {} -> request id {}: {}",
            self.conn_id,
            principal,
            req.id,
            req.method()
        );
    }

    pub fn reply(&self, principal: &str, req: &Request, elapsed: Duration, error: Option<&KeelError>) {
        if is_ping(req) {
            return;
        }
        match error {
            None => tracing::debug!(
                "[{}] {} <- reply id {}: {} ({:?})",
                self.conn_id,
                principal,
                req.id,
                req.method(),
                elapsed
            ),
            Some(err) => tracing::debug!(
                "[{}] {} <- reply id {}: {} ({:?}) error: {}",
                self.conn_id,
                principal,
                req.id,
                req.method(),
                elapsed,
                err
            ),
        }
    }
}
