//! Meter status facade.

use super::{accessible_unit, Entities, ErrorResults};
use crate::apiserver::envelope::WireError;
use crate::apiserver::facade::{
    decode_params, encode_result, no_such_request, CallContext, Facade, FacadeFuture,
};
use crate::core::error::KeelResult;
use crate::state::MeterStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct SetStatus {
    tag: String,
    code: String,
    #[serde(default)]
    info: String,
}

#[derive(Debug, Default, Deserialize)]
struct SetStatuses {
    #[serde(default)]
    statuses: Vec<SetStatus>,
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    code: String,
    #[serde(default)]
    info: String,
}

#[derive(Debug, Serialize)]
struct StatusResult {
    code: String,
    info: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<WireError>,
}

#[derive(Debug, Serialize)]
struct StatusResults {
    results: Vec<StatusResult>,
}

/// Reads and sets unit meter statuses.
#[derive(Debug, Default)]
pub struct MeterStatusFacade;

impl MeterStatusFacade {
    fn get_meter_status(&self, ctx: &CallContext, params: Entities) -> StatusResults {
        let results = params
            .entities
            .iter()
            .map(|entity| match accessible_unit(ctx, &entity.tag) {
                Ok(unit) => {
                    let status = unit.get_meter_status().unwrap_or_else(|e| {
                        tracing::debug!(unit = %unit.name(), error = %e, "meter status unavailable");
                        MeterStatus::not_available()
                    });
                    StatusResult {
                        code: status.code.to_string(),
                        info: status.info,
                        error: None,
                    }
                }
                Err(e) => StatusResult {
                    code: String::new(),
                    info: String::new(),
                    error: Some(WireError::from(&e)),
                },
            })
            .collect();
        StatusResults { results }
    }

    fn set_meter_status(&self, ctx: &CallContext, params: SetStatuses) -> ErrorResults {
        params
            .statuses
            .iter()
            .map(|status| -> KeelResult<()> {
                let mut unit = accessible_unit(ctx, &status.tag)?;
                unit.set_meter_status(&status.code, &status.info)
            })
            .collect()
    }
}

impl Facade for MeterStatusFacade {
    fn name(&self) -> &'static str {
        "MeterStatus"
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, request: &'a str, params: Value) -> FacadeFuture<'a> {
        Box::pin(async move {
            match request {
                "GetMeterStatus" => encode_result(&self.get_meter_status(ctx, decode_params(params)?)),
                "SetMeterStatus" => encode_result(&self.set_meter_status(ctx, decode_params(params)?)),
                "SetMeterStatusOnAllUnits" => {
                    ctx.require_user()?;
                    let params: StatusParams = decode_params(params)?;
                    ctx.state
                        .set_meter_status_on_all_units(&params.code, &params.info)?;
                    Ok(Value::Null)
                }
                other => Err(no_such_request(self.name(), other)),
            }
        })
    }
}
