//! API client.
//!
//! A [`Client`] holds one TLS connection and multiplexes requests over it.
//! Each request gets a fresh id; a reader task routes responses back to the
//! waiting caller by id and forwards watch notifications to a channel.

use crate::apiserver::codec::FrameCodec;
use crate::apiserver::envelope::{Request, ServerFrame, WireError};
use crate::core::error::{KeelError, KeelResult};
use crate::net::tls;
use crate::store::Change;
use crate::watch::WatchId;
use bytes::BytesMut;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

/// Changes pushed for one of the connection's watches.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub watcher_id: WatchId,
    pub changes: Vec<Change>,
}

/// Result of a successful login.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoginInfo {
    pub tag: String,
    pub environment: String,
}

type Reply = (Option<WireError>, Value);

#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<String, oneshot::Sender<Reply>>,
}

fn connection_closed() -> KeelError {
    KeelError::transport("connection closed")
}

/// A client connection to a Keel server.
pub struct Client {
    scope: String,
    next_id: AtomicU64,
    pending: Arc<Mutex<Pending>>,
    out: mpsc::UnboundedSender<Request>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("scope", &self.scope)
            .field("pending", &self.pending.lock().waiters.len())
            .finish()
    }
}

impl Client {
    /// Connect and complete the TLS handshake, trusting `ca_pem`.
    pub async fn connect(addr: SocketAddr, server_name: &str, ca_pem: &[u8]) -> KeelResult<Self> {
        let config = tls::client_config(ca_pem)?;
        let name = tls::server_name(server_name)?;
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| KeelError::transport(format!("cannot connect to {}: {}", addr, e)))?;
        let _ = tcp.set_nodelay(true);
        let stream = TlsConnector::from(config)
            .connect(name, tcp)
            .await
            .map_err(|e| KeelError::transport(format!("TLS handshake with {} failed: {}", addr, e)))?;

        let codec = FrameCodec::default();
        let (reader, writer) = tokio::io::split(stream);
        let pending = Arc::new(Mutex::new(Pending::default()));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        Ok(Self {
            scope: String::new(),
            next_id: AtomicU64::new(1),
            reader: tokio::spawn(read_loop(reader, codec, pending.clone(), notify_tx)),
            writer: tokio::spawn(write_loop(writer, codec, out_rx)),
            pending,
            out: out_tx,
            notifications: Mutex::new(Some(notify_rx)),
        })
    }

    /// Scope every following request to an environment uuid.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Call `facade.request` at version 1 in the client's scope.
    pub async fn call(&self, facade: &str, request: &str, params: Value) -> KeelResult<Value> {
        self.call_versioned(facade, 1, request, params).await
    }

    pub async fn call_versioned(
        &self,
        facade: &str,
        version: u32,
        request: &str,
        params: Value,
    ) -> KeelResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let req = Request::new(id, facade, version, request, params).with_scope(self.scope.clone());
        self.send(req).await
    }

    /// Send a fully formed request and wait for its response.
    ///
    /// The caller owns the request id and must keep it unique among this
    /// client's in-flight requests.
    pub async fn send(&self, req: Request) -> KeelResult<Value> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(connection_closed());
            }
            if pending.waiters.contains_key(&req.id) {
                return Err(KeelError::invalid(format!("request id {:?} already in flight", req.id)));
            }
            pending.waiters.insert(req.id.clone(), tx);
        }
        let id = req.id.clone();
        if self.out.send(req).is_err() {
            self.pending.lock().waiters.remove(&id);
            return Err(connection_closed());
        }
        match rx.await {
            Ok((None, result)) => Ok(result),
            Ok((Some(error), _)) => Err(error.into_error()),
            Err(_) => Err(connection_closed()),
        }
    }

    /// Log in with an entity tag and password.
    pub async fn login(&self, auth_tag: &str, password: &str) -> KeelResult<LoginInfo> {
        let result = self
            .call(
                "Admin",
                "Login",
                json!({ "auth_tag": auth_tag, "password": password }),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| KeelError::internal(format!("bad login result: {}", e)))
    }

    pub async fn ping(&self) -> KeelResult<()> {
        self.call("Pinger", "Ping", Value::Null).await.map(|_| ())
    }

    /// Take the notification stream. Returns `None` after the first call.
    pub fn notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notifications.lock().take()
    }

    /// Whether the server side has gone away.
    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }

    /// Close the connection and wait for its tasks to exit.
    pub async fn close(self) {
        let Self {
            out,
            reader,
            writer,
            ..
        } = self;
        drop(out);
        let _ = writer.await;
        let _ = reader.await;
    }
}

async fn read_loop<R>(
    mut reader: R,
    codec: FrameCodec,
    pending: Arc<Mutex<Pending>>,
    notifications: mpsc::UnboundedSender<Notification>,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    loop {
        match codec.read_frame::<_, ServerFrame>(&mut reader, &mut buffer).await {
            Ok(Some(ServerFrame::Response { id, error, result })) => {
                let waiter = pending.lock().waiters.remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send((error, result));
                    }
                    None => tracing::warn!(id = %id, "response for unknown request"),
                }
            }
            Ok(Some(ServerFrame::Notification {
                watcher_id,
                changes,
            })) => {
                let _ = notifications.send(Notification {
                    watcher_id,
                    changes,
                });
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "client connection failed");
                break;
            }
        }
    }
    let mut pending = pending.lock();
    pending.closed = true;
    pending.waiters.clear();
}

async fn write_loop<W>(mut writer: W, codec: FrameCodec, mut requests: mpsc::UnboundedReceiver<Request>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(req) = requests.recv().await {
        if let Err(e) = codec.write_frame(&mut writer, &req).await {
            tracing::debug!(error = %e, "client write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
