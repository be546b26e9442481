//! Watcher facade.
//!
//! `Watch` subscribes the connection to changes under a collection and
//! local id prefix of this environment. Changes arrive as notification
//! frames tagged with the returned watcher id until `Stop` or until the
//! connection closes.

use crate::apiserver::facade::{decode_params, no_such_request, CallContext, Facade, FacadeFuture};
use crate::core::error::{KeelError, KeelResult};
use crate::state::collections;
use crate::watch::{WatchId, WatchKey};
use serde::Deserialize;
use serde_json::Value;

const WATCHABLE: &[&str] = &[
    collections::ENVIRONMENTS,
    collections::SERVICES,
    collections::UNITS,
    collections::METER_STATUS,
    collections::METRICS,
    collections::REQUESTED_NETWORKS,
    collections::STORAGE_INSTANCES,
    collections::STORAGE_ATTACHMENTS,
];

#[derive(Debug, Deserialize)]
struct WatchParams {
    collection: String,
    /// Local id prefix; empty watches the whole collection.
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct StopParams {
    watcher_id: WatchId,
}

/// Starts and stops change watches for the calling connection.
#[derive(Debug, Default)]
pub struct WatcherFacade;

impl WatcherFacade {
    fn key(&self, ctx: &CallContext, params: &WatchParams) -> KeelResult<WatchKey> {
        if !WATCHABLE.contains(&params.collection.as_str()) {
            return Err(KeelError::invalid(format!(
                "cannot watch collection {:?}",
                params.collection
            )));
        }
        let prefix = if collections::is_global(&params.collection) {
            ctx.state.env_uuid().to_string()
        } else {
            ctx.state.doc_id(&params.id)
        };
        Ok(WatchKey::new(params.collection.clone(), prefix))
    }
}

impl Facade for WatcherFacade {
    fn name(&self) -> &'static str {
        "Watcher"
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, request: &'a str, params: Value) -> FacadeFuture<'a> {
        Box::pin(async move {
            match request {
                "Watch" => {
                    ctx.require_user()?;
                    let params: WatchParams = decode_params(params)?;
                    let watcher_id = ctx.watchers.start(self.key(ctx, &params)?);
                    tracing::debug!(conn = %ctx.conn_id, watcher_id, collection = %params.collection, "watch started");
                    Ok(serde_json::json!({ "watcher_id": watcher_id }))
                }
                "Stop" => {
                    let params: StopParams = decode_params(params)?;
                    if ctx.watchers.stop(params.watcher_id) {
                        Ok(Value::Null)
                    } else {
                        Err(KeelError::not_found(format!("watcher {}", params.watcher_id)))
                    }
                }
                other => Err(no_such_request(self.name(), other)),
            }
        })
    }
}
