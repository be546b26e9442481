//! Metrics facade.
//!
//! Units add batches for themselves; users list, count, send in batches,
//! mark sent and clean up.

use super::{accessible_unit, ErrorResult};
use crate::apiserver::facade::{
    decode_params, encode_result, no_such_request, CallContext, Facade, FacadeFuture,
};
use crate::core::error::{KeelError, KeelResult};
use crate::state::{BulkMetrics, Metric, MetricBatch, Tag};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
struct NewBatch {
    tag: String,
    /// Defaults to the server clock.
    #[serde(default)]
    created: Option<DateTime<Utc>>,
    metrics: Vec<Metric>,
}

#[derive(Debug, Default, Deserialize)]
struct AddBatches {
    #[serde(default)]
    batches: Vec<NewBatch>,
}

#[derive(Debug, Serialize)]
struct AddResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    uuid: Option<String>,
    #[serde(flatten)]
    outcome: ErrorResult,
}

#[derive(Debug, Default, Deserialize)]
struct BatchIds {
    #[serde(default)]
    uuids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SendParams {
    batch_size: usize,
}

/// Metrics keyed by charm url, then unit tag.
#[derive(Debug, Default, Deserialize)]
struct BulkParams {
    #[serde(default)]
    metrics: BTreeMap<String, BTreeMap<String, Vec<Metric>>>,
}

#[derive(Debug, Serialize)]
struct BatchInfo<'a> {
    uuid: &'a str,
    env_uuid: &'a str,
    unit: &'a str,
    charm_url: &'a str,
    sent: bool,
    created: DateTime<Utc>,
    metrics: &'a [Metric],
}

impl<'a> From<&'a MetricBatch> for BatchInfo<'a> {
    fn from(batch: &'a MetricBatch) -> Self {
        Self {
            uuid: batch.uuid(),
            env_uuid: batch.env_uuid(),
            unit: batch.unit(),
            charm_url: batch.charm_url(),
            sent: batch.sent(),
            created: batch.created(),
            metrics: batch.metrics(),
        }
    }
}

/// Records and manages metric batches.
#[derive(Debug, Default)]
pub struct MetricsFacade;

impl MetricsFacade {
    fn add_metric_batches(&self, ctx: &CallContext, params: AddBatches) -> Value {
        let results: Vec<AddResult> = params
            .batches
            .into_iter()
            .map(|batch| {
                let added = accessible_unit(ctx, &batch.tag).and_then(|unit| {
                    let created = batch.created.unwrap_or_else(|| ctx.state.clock().now());
                    unit.add_metrics(created, batch.metrics)
                });
                match added {
                    Ok(batch) => AddResult {
                        uuid: Some(batch.uuid().to_string()),
                        outcome: ErrorResult::default(),
                    },
                    Err(e) => AddResult {
                        uuid: None,
                        outcome: ErrorResult::from_result::<()>(Err(e)),
                    },
                }
            })
            .collect();
        serde_json::json!({ "results": results })
    }

    fn set_sent(&self, ctx: &CallContext, params: BatchIds) -> KeelResult<Value> {
        ctx.require_user()?;
        let results: super::ErrorResults = params
            .uuids
            .iter()
            .map(|uuid| -> KeelResult<()> { ctx.state.metric_batch(uuid)?.set_sent() })
            .collect();
        encode_result(&results)
    }

    fn metric_batches(&self, ctx: &CallContext) -> KeelResult<Value> {
        ctx.require_user()?;
        Self::batch_infos(&ctx.state.metric_batches()?)
    }

    fn batch_infos(batches: &[MetricBatch]) -> KeelResult<Value> {
        let infos: Vec<BatchInfo<'_>> = batches.iter().map(BatchInfo::from).collect();
        encode_result(&serde_json::json!({ "batches": infos }))
    }

    fn metrics_to_send(&self, ctx: &CallContext, params: SendParams) -> KeelResult<Value> {
        ctx.require_user()?;
        Self::batch_infos(&ctx.state.metrics_to_send(params.batch_size)?)
    }

    fn set_metric_batches_sent(&self, ctx: &CallContext, params: BatchIds) -> KeelResult<Value> {
        ctx.require_user()?;
        ctx.state.set_metric_batches_sent(&params.uuids)?;
        Ok(Value::Null)
    }

    fn count(&self, ctx: &CallContext, sent: bool) -> KeelResult<Value> {
        ctx.require_user()?;
        let count = if sent {
            ctx.state.count_of_sent_metrics()?
        } else {
            ctx.state.count_of_unsent_metrics()?
        };
        Ok(serde_json::json!({ "count": count }))
    }

    fn add_bulk_metrics(&self, ctx: &CallContext, params: BulkParams) -> KeelResult<Value> {
        ctx.require_user()?;
        let mut bulk = BulkMetrics::new();
        for (charm_url, units) in params.metrics {
            let entry = bulk.entry(charm_url).or_default();
            for (tag, metrics) in units {
                match Tag::parse(&tag)? {
                    Tag::Unit(name) => {
                        entry.insert(name, metrics);
                    }
                    other => return Err(KeelError::invalid(format!("{} is not a unit tag", other))),
                }
            }
        }
        let batches = ctx.state.add_bulk_metrics(bulk)?;
        let uuids: Vec<&str> = batches.iter().map(|b| b.uuid()).collect();
        Ok(serde_json::json!({ "uuids": uuids }))
    }

    fn cleanup_old_metrics(&self, ctx: &CallContext) -> KeelResult<Value> {
        ctx.require_user()?;
        let removed = ctx.state.cleanup_old_metrics()?;
        Ok(serde_json::json!({ "removed": removed }))
    }
}

impl Facade for MetricsFacade {
    fn name(&self) -> &'static str {
        "Metrics"
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, request: &'a str, params: Value) -> FacadeFuture<'a> {
        Box::pin(async move {
            match request {
                "AddMetricBatches" => Ok(self.add_metric_batches(ctx, decode_params(params)?)),
                "SetSent" => self.set_sent(ctx, decode_params(params)?),
                "MetricBatches" => self.metric_batches(ctx),
                "CleanupOldMetrics" => self.cleanup_old_metrics(ctx),
                "MetricsToSend" => self.metrics_to_send(ctx, decode_params(params)?),
                "SetMetricBatchesSent" => self.set_metric_batches_sent(ctx, decode_params(params)?),
                "CountOfSentMetrics" => self.count(ctx, true),
                "CountOfUnsentMetrics" => self.count(ctx, false),
                "AddBulkMetrics" => self.add_bulk_metrics(ctx, decode_params(params)?),
                other => Err(no_such_request(self.name(), other)),
            }
        })
    }
}
