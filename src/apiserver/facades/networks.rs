//! Requested networks facade.

use super::Entities;
use crate::apiserver::envelope::WireError;
use crate::apiserver::facade::{decode_params, no_such_request, CallContext, Facade, FacadeFuture};
use crate::core::error::{KeelError, KeelResult};
use crate::state::networks::{service_global_key, unit_global_key};
use crate::state::Tag;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
struct NetworksResult {
    networks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<WireError>,
}

/// Reports the networks requested for services and units.
#[derive(Debug, Default)]
pub struct NetworksFacade;

impl NetworksFacade {
    fn requested(&self, ctx: &CallContext, tag: &str) -> KeelResult<Vec<String>> {
        let tag = Tag::parse(tag)?;
        let key = match &tag {
            Tag::Service(name) => {
                ctx.require_user()?;
                ctx.state.service(name)?;
                service_global_key(name)
            }
            Tag::Unit(name) => {
                ctx.check_access(&tag)?;
                ctx.state.unit(name)?;
                unit_global_key(name)
            }
            other => {
                return Err(KeelError::invalid(format!(
                    "{} has no requested networks",
                    other
                )))
            }
        };
        ctx.state.read_requested_networks(&key)
    }
}

impl Facade for NetworksFacade {
    fn name(&self) -> &'static str {
        "Networks"
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, request: &'a str, params: Value) -> FacadeFuture<'a> {
        Box::pin(async move {
            match request {
                "RequestedNetworks" => {
                    let params: Entities = decode_params(params)?;
                    let results: Vec<NetworksResult> = params
                        .entities
                        .iter()
                        .map(|entity| match self.requested(ctx, &entity.tag) {
                            Ok(networks) => NetworksResult {
                                networks,
                                error: None,
                            },
                            Err(e) => NetworksResult {
                                networks: Vec::new(),
                                error: Some(WireError::from(&e)),
                            },
                        })
                        .collect();
                    Ok(serde_json::json!({ "results": results }))
                }
                other => Err(no_such_request(self.name(), other)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apiserver::facades::testing;
    use serde_json::json;

    #[tokio::test]
    async fn test_requested_networks() {
        let st = testing::state();
        let admin = testing::admin(&st);
        let got = NetworksFacade
            .call(
                &admin,
                "RequestedNetworks",
                json!({"entities": [
                    {"tag": "service-wordpress"},
                    {"tag": "service-mysql"},
                    {"tag": "user-admin"},
                ]}),
            )
            .await
            .unwrap();
        assert_eq!(got["results"][0]["networks"], json!(["db"]));
        assert_eq!(got["results"][1]["error"]["code"], "not found");
        assert_eq!(got["results"][2]["error"]["code"], "bad request");

        let unit = testing::unit(&st, "wordpress/0");
        let got = NetworksFacade
            .call(&unit, "RequestedNetworks", json!({"entities": [{"tag": "service-wordpress"}]}))
            .await
            .unwrap();
        assert_eq!(got["results"][0]["error"]["code"], "unauthorized access");
    }
}
