//! Liveness probe.

use crate::apiserver::facade::{no_such_request, CallContext, Facade, FacadeFuture};
use serde_json::Value;

/// `Pinger.Ping` answers `null` to any authenticated caller.
#[derive(Debug, Default)]
pub struct PingerFacade;

impl Facade for PingerFacade {
    fn name(&self) -> &'static str {
        "Pinger"
    }

    fn call<'a>(&'a self, _ctx: &'a CallContext, request: &'a str, _params: Value) -> FacadeFuture<'a> {
        Box::pin(async move {
            match request {
                "Ping" => Ok(Value::Null),
                other => Err(no_such_request(self.name(), other)),
            }
        })
    }
}
