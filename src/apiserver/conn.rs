//! Connection task.
//!
//! One task per connection reads frames and spawns one task per request,
//! so requests on a connection are served concurrently and may complete out
//! of order. Responses and watch notifications funnel through a single
//! writer task. When the server starts dying the reader stops taking new
//! requests, in-flight requests finish, their responses are flushed and the
//! connection closes.

use super::codec::{EncodeResult, FrameCodec};
use super::envelope::{Request, ServerFrame};
use super::facade::{decode_params, encode_result, CallContext};
use super::notifier::RequestNotifier;
use super::{until_dying, Shared};
use crate::core::error::{KeelError, KeelResult};
use crate::net::tcp::{ConnectionId, TcpConnection};
use crate::state::Principal;
use crate::watch::{WatchHub, WatchId, WatchKey};
use bytes::BytesMut;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_rustls::TlsAcceptor;

/// Items queued for the writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(ServerFrame),
    /// Flush and close. Anything queued after this is dropped.
    Close,
}

/// Watches owned by one connection. Changes are forwarded to the client as
/// notification frames.
pub struct ConnWatchers {
    hub: Arc<WatchHub>,
    out: mpsc::UnboundedSender<Outbound>,
    ids: Mutex<HashSet<WatchId>>,
}

impl ConnWatchers {
    pub(crate) fn new(hub: Arc<WatchHub>, out: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            hub,
            out,
            ids: Mutex::new(HashSet::new()),
        }
    }

    /// Start a watch and forward its changes.
    pub fn start(&self, key: WatchKey) -> WatchId {
        let watch = self.hub.watch(key);
        let watcher_id = watch.id;
        let mut changes = watch.changes;
        let out = self.out.clone();
        self.ids.lock().insert(watcher_id);
        tokio::spawn(async move {
            while let Some(changes) = changes.recv().await {
                let frame = ServerFrame::Notification {
                    watcher_id,
                    changes,
                };
                if out.send(Outbound::Frame(frame)).is_err() {
                    break;
                }
            }
        });
        watcher_id
    }

    /// Stop one of this connection's watches.
    pub fn stop(&self, id: WatchId) -> bool {
        if !self.ids.lock().remove(&id) {
            return false;
        }
        self.hub.stop(id)
    }

    pub fn stop_all(&self) {
        let ids: Vec<WatchId> = self.ids.lock().drain().collect();
        for id in ids {
            self.hub.stop(id);
        }
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}

struct Auth {
    principal: Principal,
    /// Scope the login was made with.
    scope: String,
}

struct Conn {
    id: ConnectionId,
    notifier: RequestNotifier,
    auth: Mutex<Option<Auth>>,
    in_flight: Mutex<HashSet<String>>,
    out: mpsc::UnboundedSender<Outbound>,
    watchers: Arc<ConnWatchers>,
}

impl Conn {
    fn principal(&self) -> Option<Principal> {
        self.auth.lock().as_ref().map(|auth| auth.principal.clone())
    }

    fn principal_name(&self) -> String {
        self.principal()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "<unknown>".to_string())
    }

    /// Empty scope is only valid on connections that logged in without one.
    fn check_unscoped(&self) -> KeelResult<()> {
        let login_scope_empty = self
            .auth
            .lock()
            .as_ref()
            .map_or(true, |auth| auth.scope.is_empty());
        if login_scope_empty {
            Ok(())
        } else {
            Err(KeelError::UnknownScope {
                scope: String::new(),
            })
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginParams {
    auth_tag: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResult {
    tag: String,
    environment: String,
}

enum Event {
    Dying,
    Frame(KeelResult<Option<Request>>),
    Finished(Result<(), JoinError>),
}

/// Serve one accepted connection until it closes or the server drains it.
pub(crate) async fn serve(shared: Arc<Shared>, tcp: TcpConnection, acceptor: TlsAcceptor) {
    let id = tcp.id;
    let remote = tcp.remote_addr;
    let created_at = tcp.created_at;
    let mut lifecycle = shared.subscribe();

    let stream = tokio::select! {
        _ = until_dying(&mut lifecycle) => None,
        result = acceptor.accept(tcp.into_stream()) => match result {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::debug!(conn = %id, remote = %remote, error = %e, "TLS handshake failed");
                None
            }
        },
    };
    let Some(stream) = stream else {
        shared.metrics.connection_closed();
        return;
    };

    let notifier = RequestNotifier::new(id);
    notifier.join(remote);

    let (mut reader, writer) = tokio::io::split(stream);
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, out_rx, shared.codec));
    let conn = Arc::new(Conn {
        id,
        notifier,
        auth: Mutex::new(None),
        in_flight: Mutex::new(HashSet::new()),
        watchers: Arc::new(ConnWatchers::new(shared.state.hub().clone(), out_tx.clone())),
        out: out_tx,
    });

    let mut requests = JoinSet::new();
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    loop {
        let event = tokio::select! {
            _ = until_dying(&mut lifecycle) => Event::Dying,
            frame = shared.codec.read_frame::<_, Request>(&mut reader, &mut buffer) => Event::Frame(frame),
            Some(done) = requests.join_next(), if !requests.is_empty() => Event::Finished(done),
        };
        match event {
            Event::Dying => {
                tracing::debug!(conn = %id, in_flight = requests.len(), "server dying, draining connection");
                break;
            }
            Event::Frame(Ok(Some(req))) => {
                shared.metrics.request_received();
                if !conn.in_flight.lock().insert(req.id.clone()) {
                    shared.metrics.request_failed();
                    let err = KeelError::invalid(format!("duplicate request id {:?}", req.id));
                    let _ = conn
                        .out
                        .send(Outbound::Frame(ServerFrame::response(req.id, &Err(err))));
                    continue;
                }
                requests.spawn(handle_request(shared.clone(), conn.clone(), req));
            }
            Event::Frame(Ok(None)) => break,
            Event::Frame(Err(e)) => {
                tracing::debug!(conn = %id, error = %e, "closing connection");
                break;
            }
            Event::Finished(done) => log_join(id, done),
        }
    }

    while let Some(done) = requests.join_next().await {
        log_join(id, done);
    }
    conn.watchers.stop_all();
    let _ = conn.out.send(Outbound::Close);
    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(conn = %id, error = %e, "writer failed"),
        Err(e) => tracing::error!(conn = %id, error = %e, "writer task panicked"),
    }
    shared.metrics.connection_closed();
    conn.notifier.leave(created_at.elapsed());
}

fn log_join(id: ConnectionId, done: Result<(), JoinError>) {
    if let Err(e) = done {
        if e.is_panic() {
            tracing::error!(conn = %id, "request task panicked");
        }
    }
}

async fn handle_request(shared: Arc<Shared>, conn: Arc<Conn>, req: Request) {
    let started = Instant::now();
    conn.notifier.request(&conn.principal_name(), &req);

    let outcome = dispatch(&shared, &conn, &req).await;
    if outcome.is_err() {
        shared.metrics.request_failed();
    }
    conn.notifier
        .reply(&conn.principal_name(), &req, started.elapsed(), outcome.as_ref().err());

    conn.in_flight.lock().remove(&req.id);
    let _ = conn
        .out
        .send(Outbound::Frame(ServerFrame::response(req.id, &outcome)));
}

async fn dispatch(shared: &Shared, conn: &Conn, req: &Request) -> KeelResult<Value> {
    if req.facade == "Admin" && req.request == "Login" {
        return login(shared, conn, req).await;
    }
    // A wrong environment is reported before a missing login.
    if !req.scope.is_empty() {
        shared.check_scope(&req.scope)?;
    }
    let principal = conn.principal().ok_or(KeelError::Unauthenticated)?;
    if req.scope.is_empty() {
        conn.check_unscoped()?;
    }
    let facade = shared.registry.resolve(&req.facade, req.version)?;
    let ctx = CallContext {
        conn_id: conn.id,
        principal,
        state: shared.state.clone(),
        watchers: conn.watchers.clone(),
    };
    facade.call(&ctx, &req.request, req.params.clone()).await
}

async fn login(shared: &Shared, conn: &Conn, req: &Request) -> KeelResult<Value> {
    if conn.auth.lock().is_some() {
        return Err(KeelError::AlreadyLoggedIn);
    }
    if !req.scope.is_empty() {
        shared.check_scope(&req.scope)?;
    }
    let params: LoginParams = decode_params(req.params.clone())?;

    let principal = {
        let _permit = shared.limiter.acquire().await?;
        shared.metrics.login_started();
        let result = shared
            .authenticator
            .authenticate(&params.auth_tag, &params.password)
            .await;
        shared.metrics.login_finished();
        result?
    };

    {
        let mut auth = conn.auth.lock();
        if auth.is_some() {
            return Err(KeelError::AlreadyLoggedIn);
        }
        *auth = Some(Auth {
            principal: principal.clone(),
            scope: req.scope.clone(),
        });
    }
    tracing::info!(conn = %conn.id, principal = %principal, "login succeeded");
    encode_result(&LoginResult {
        tag: principal.tag.to_string(),
        environment: shared.state.env_uuid().to_string(),
    })
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    codec: FrameCodec,
) -> KeelResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(out) = rx.recv().await {
        let frame = match out {
            Outbound::Frame(frame) => frame,
            Outbound::Close => break,
        };
        match codec.encode(&frame) {
            EncodeResult::Ok(bytes) => {
                writer
                    .write_all(&bytes)
                    .await
                    .map_err(|e| KeelError::transport(format!("write error: {}", e)))?;
                writer
                    .flush()
                    .await
                    .map_err(|e| KeelError::transport(format!("write error: {}", e)))?;
            }
            EncodeResult::Error(message) => {
                tracing::warn!(error = %message, "dropping unencodable frame");
                if let ServerFrame::Response { id, .. } = frame {
                    let fallback = ServerFrame::response(id, &Err(KeelError::internal(message)));
                    codec.write_frame(&mut writer, &fallback).await?;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}
