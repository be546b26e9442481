//! Metric batches.
//!
//! Units report metrics in batches. Batches are kept until they have been
//! sent on and are older than [`CLEANUP_AGE_HOURS`].

use super::collections::{METRICS, UNITS};
use super::life::{self, Life};
use super::unit::Unit;
use super::State;
use crate::core::error::{KeelError, KeelResult};
use crate::store::{encode_fields, Document};
use crate::core::time::now_to_the_second;
use crate::txn::{fields, Assertion, Operation, Predicate, TxnPlan};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Sent batches older than this many hours are removed by cleanup.
pub const CLEANUP_AGE_HOURS: i64 = 24;

/// Metrics keyed by charm url, then unit name.
pub type BulkMetrics = BTreeMap<String, BTreeMap<String, Vec<Metric>>>;

/// One metric reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    pub key: String,
    pub value: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub credentials: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetricBatchDoc {
    uuid: String,
    env_uuid: String,
    unit: String,
    charm_url: String,
    sent: bool,
    created: DateTime<Utc>,
    metrics: Vec<Metric>,
}

/// A batch of metrics reported by one unit.
#[derive(Debug, Clone)]
pub struct MetricBatch {
    st: State,
    doc: MetricBatchDoc,
}

impl MetricBatch {
    fn from_doc(st: &State, doc: Document) -> KeelResult<Self> {
        Ok(Self {
            st: st.clone(),
            doc: doc.decode()?,
        })
    }

    pub fn uuid(&self) -> &str {
        &self.doc.uuid
    }

    pub fn env_uuid(&self) -> &str {
        &self.doc.env_uuid
    }

    pub fn unit(&self) -> &str {
        &self.doc.unit
    }

    pub fn charm_url(&self) -> &str {
        &self.doc.charm_url
    }

    pub fn sent(&self) -> bool {
        self.doc.sent
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.doc.created
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.doc.metrics
    }

    /// Mark the batch as sent.
    pub fn set_sent(&mut self) -> KeelResult<()> {
        self.st
            .run_ops(vec![Operation::new(METRICS, self.st.doc_id(&self.doc.uuid))
                .assert(Assertion::DocExists)
                .set(fields([("sent", true)]))])
            .map_err(|e| match e {
                KeelError::TxnAborted => {
                    KeelError::not_found(format!("metric batch {:?}", self.doc.uuid))
                }
                other => other.annotate(format!("cannot set metric sent for {}", self.doc.uuid)),
            })?;
        self.doc.sent = true;
        Ok(())
    }
}

impl Unit {
    /// Record a batch of metrics for this unit.
    ///
    /// Fails with `NotFound` naming the unit if it is dead or removed.
    pub fn add_metrics(&self, created: DateTime<Utc>, metrics: Vec<Metric>) -> KeelResult<MetricBatch> {
        if metrics.is_empty() {
            return Err(KeelError::invalid("cannot add a batch of 0 metrics"));
        }
        let unit_gone = || KeelError::not_found(self.name());
        if self.life() == Life::Dead {
            return Err(unit_gone());
        }

        let doc = MetricBatchDoc {
            uuid: uuid::Uuid::new_v4().to_string(),
            env_uuid: self.st.env_uuid().to_string(),
            unit: self.name().to_string(),
            charm_url: self.charm_url().to_string(),
            sent: false,
            created,
            metrics,
        };
        let st = self.st.clone();
        st.run(|attempt| {
            if attempt > 0 && !st.unit_not_dead(self.name())? {
                return Err(unit_gone());
            }
            Ok(TxnPlan::Apply(vec![
                Operation::new(UNITS, self.doc_id()).assert(life::not_dead()),
                Operation::new(METRICS, st.doc_id(&doc.uuid))
                    .assert(Assertion::DocMissing)
                    .insert(encode_fields(&doc)?),
            ]))
        })?;

        tracing::debug!(unit = %self.name(), batch = %doc.uuid, metrics = doc.metrics.len(), "metric batch added");
        st.metric_batch(&doc.uuid)
    }
}

impl State {
    /// Whether the unit exists and is not dead.
    fn unit_not_dead(&self, unit: &str) -> KeelResult<bool> {
        Ok(self.fetch(UNITS, unit)?.is_some_and(|doc| {
            doc.get("life").and_then(|v| v.as_str()) != Some(Life::Dead.as_str())
        }))
    }

    /// Look up a metric batch.
    pub fn metric_batch(&self, uuid: &str) -> KeelResult<MetricBatch> {
        let doc = self
            .fetch(METRICS, uuid)?
            .ok_or_else(|| KeelError::not_found(format!("metric batch {:?}", uuid)))?;
        MetricBatch::from_doc(self, doc)
    }

    /// Every metric batch in the environment.
    pub fn metric_batches(&self) -> KeelResult<Vec<MetricBatch>> {
        self.scan(METRICS, "")?
            .into_iter()
            .map(|doc| MetricBatch::from_doc(self, doc))
            .collect()
    }

    /// Remove sent batches older than [`CLEANUP_AGE_HOURS`]. Returns how many
    /// batches were removed.
    pub fn cleanup_old_metrics(&self) -> KeelResult<usize> {
        let cutoff = self.clock().now() - Duration::hours(CLEANUP_AGE_HOURS);
        let mut removed = 0;
        self.run(|_| {
            let mut ops = Vec::new();
            for batch in self.metric_batches()? {
                if batch.sent() && batch.created() < cutoff {
                    ops.push(
                        Operation::new(METRICS, self.doc_id(batch.uuid()))
                            .assert(Assertion::Matches(Predicate::eq("sent", true)))
                            .remove(),
                    );
                }
            }
            removed = ops.len();
            Ok(TxnPlan::Apply(ops))
        })
        .map_err(|e| e.annotate("cannot cleanup old metrics"))?;
        if removed > 0 {
            tracing::info!(removed, "old metric batches cleaned up");
        }
        Ok(removed)
    }

    /// Number of batches already sent.
    pub fn count_of_sent_metrics(&self) -> KeelResult<usize> {
        Ok(self.metric_batches()?.iter().filter(|b| b.sent()).count())
    }

    /// Number of batches waiting to be sent.
    pub fn count_of_unsent_metrics(&self) -> KeelResult<usize> {
        Ok(self.metric_batches()?.iter().filter(|b| !b.sent()).count())
    }

    /// Up to `batch_size` unsent batches, oldest first.
    pub fn metrics_to_send(&self, batch_size: usize) -> KeelResult<Vec<MetricBatch>> {
        let mut unsent: Vec<MetricBatch> = self
            .metric_batches()?
            .into_iter()
            .filter(|b| !b.sent())
            .collect();
        unsent.sort_by(|a, b| {
            a.created()
                .cmp(&b.created())
                .then_with(|| a.uuid().cmp(b.uuid()))
        });
        unsent.truncate(batch_size);
        Ok(unsent)
    }

    /// Mark several batches sent in one transaction. Either every batch is
    /// marked or none is.
    pub fn set_metric_batches_sent(&self, uuids: &[String]) -> KeelResult<()> {
        let ops = uuids
            .iter()
            .map(|uuid| {
                Operation::new(METRICS, self.doc_id(uuid))
                    .assert(Assertion::DocExists)
                    .set(fields([("sent", true)]))
            })
            .collect();
        self.run_ops(ops)
            .map_err(|e| e.annotate("cannot set metric batches sent"))?;
        tracing::debug!(batches = uuids.len(), "metric batches marked sent");
        Ok(())
    }

    /// Record one batch per unit in `bulk`, all in one transaction. Batches
    /// take their charm url from the map key and are stamped with the state
    /// clock. Returned in charm url, then unit name order.
    pub fn add_bulk_metrics(&self, bulk: BulkMetrics) -> KeelResult<Vec<MetricBatch>> {
        let created = now_to_the_second(self.clock());
        let mut docs = Vec::new();
        for (charm_url, units) in bulk {
            for (unit, metrics) in units {
                if metrics.is_empty() {
                    return Err(KeelError::invalid(format!(
                        "cannot add a batch of 0 metrics for unit {:?}",
                        unit
                    )));
                }
                docs.push(MetricBatchDoc {
                    uuid: uuid::Uuid::new_v4().to_string(),
                    env_uuid: self.env_uuid().to_string(),
                    unit,
                    charm_url: charm_url.clone(),
                    sent: false,
                    created,
                    metrics,
                });
            }
        }

        self.run(|_| {
            let mut asserted = BTreeSet::new();
            let mut ops = Vec::new();
            for doc in &docs {
                if asserted.insert(doc.unit.as_str()) {
                    if !self.unit_not_dead(&doc.unit)? {
                        return Err(KeelError::not_found(doc.unit.clone()));
                    }
                    ops.push(Operation::new(UNITS, self.doc_id(&doc.unit)).assert(life::not_dead()));
                }
                ops.push(
                    Operation::new(METRICS, self.doc_id(&doc.uuid))
                        .assert(Assertion::DocMissing)
                        .insert(encode_fields(doc)?),
                );
            }
            Ok(TxnPlan::Apply(ops))
        })
        .map_err(|e| e.annotate("cannot add bulk metrics"))?;

        tracing::debug!(batches = docs.len(), "bulk metric batches added");
        docs.iter().map(|doc| self.metric_batch(&doc.uuid)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::{now_to_the_second, Clock, ManualClock};
    use crate::state::StateOptions;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn setup() -> (State, Arc<ManualClock>, Unit) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let st = State::open(
            Arc::new(MemoryStore::new()),
            "env-1",
            StateOptions {
                clock: clock.clone(),
                ..StateOptions::default()
            },
        );
        st.initialize("test", "admin", "pw").unwrap();
        let mut svc = st
            .add_service("wordpress", "local:quantal/quantal-wordpress-3", &[])
            .unwrap();
        let unit = svc.add_unit().unwrap();
        (st, clock, unit)
    }

    fn metric(time: DateTime<Utc>) -> Metric {
        Metric {
            key: "item".to_string(),
            value: "5".to_string(),
            time,
            credentials: b"creds".to_vec(),
        }
    }

    #[test]
    fn test_add_no_metrics() {
        let (st, _clock, unit) = setup();
        let err = unit.add_metrics(now_to_the_second(st.clock()), vec![]).unwrap_err();
        assert!(err.to_string().contains("cannot add a batch of 0 metrics"));
    }

    #[test]
    fn test_add_metric() {
        let (st, _clock, unit) = setup();
        let now = now_to_the_second(st.clock());
        let batch = unit.add_metrics(now, vec![metric(now)]).unwrap();
        assert_eq!(batch.unit(), "wordpress/0");
        assert_eq!(batch.env_uuid(), "env-1");
        assert_eq!(batch.charm_url(), "local:quantal/quantal-wordpress-3");
        assert!(!batch.sent());
        assert_eq!(batch.created(), now);

        let saved = st.metric_batch(batch.uuid()).unwrap();
        assert_eq!(saved.metrics(), &[metric(now)]);
    }

    #[test]
    fn test_add_metric_dead_or_removed_unit() {
        let (st, _clock, unit) = setup();
        let now = now_to_the_second(st.clock());

        let mut dead = unit.clone();
        dead.ensure_dead().unwrap();
        let err = unit.add_metrics(now, vec![metric(now)]).unwrap_err();
        assert_eq!(err.to_string(), "wordpress/0 not found");

        dead.remove().unwrap();
        let err = unit.add_metrics(now, vec![metric(now)]).unwrap_err();
        assert_eq!(err.to_string(), "wordpress/0 not found");
    }

    #[test]
    fn test_set_sent() {
        let (st, _clock, unit) = setup();
        let now = now_to_the_second(st.clock());
        let added = unit.add_metrics(now, vec![metric(now)]).unwrap();
        let mut saved = st.metric_batch(added.uuid()).unwrap();
        saved.set_sent().unwrap();
        assert!(saved.sent());
        assert!(st.metric_batch(added.uuid()).unwrap().sent());
    }

    #[test]
    fn test_cleanup_old_metrics() {
        let (st, clock, unit) = setup();
        let old_time = clock.now() - Duration::hours(25);
        let mut old = unit.add_metrics(old_time, vec![metric(old_time)]).unwrap();
        old.set_sent().unwrap();

        let now = clock.now();
        let mut fresh = unit.add_metrics(now, vec![metric(now)]).unwrap();
        fresh.set_sent().unwrap();

        let unsent = unit.add_metrics(old_time, vec![metric(old_time)]).unwrap();

        assert_eq!(st.cleanup_old_metrics().unwrap(), 1);
        assert!(st.metric_batch(fresh.uuid()).is_ok());
        assert!(st.metric_batch(unsent.uuid()).is_ok());
        assert!(st.metric_batch(old.uuid()).unwrap_err().is_not_found());
        assert_eq!(st.metric_batches().unwrap().len(), 2);

        // Nothing left to clean.
        assert_eq!(st.cleanup_old_metrics().unwrap(), 0);
    }

    fn add_unsent(unit: &Unit, clock: &ManualClock, count: usize) -> Vec<MetricBatch> {
        (0..count)
            .map(|_| {
                let now = clock.now();
                unit.add_metrics(now, vec![metric(now)]).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_count_metrics() {
        let (st, clock, unit) = setup();
        let mut batches = add_unsent(&unit, &clock, 3);
        batches[0].set_sent().unwrap();
        assert_eq!(st.count_of_sent_metrics().unwrap(), 1);
        assert_eq!(st.count_of_unsent_metrics().unwrap(), 2);
    }

    #[test]
    fn test_set_metric_batches_sent() {
        let (st, clock, unit) = setup();
        let uuids: Vec<String> = add_unsent(&unit, &clock, 3)
            .iter()
            .map(|b| b.uuid().to_string())
            .collect();
        st.set_metric_batches_sent(&uuids).unwrap();
        assert_eq!(st.count_of_sent_metrics().unwrap(), 3);
        assert_eq!(st.count_of_unsent_metrics().unwrap(), 0);
    }

    #[test]
    fn test_set_metric_batches_sent_is_all_or_nothing() {
        let (st, clock, unit) = setup();
        let mut uuids: Vec<String> = add_unsent(&unit, &clock, 2)
            .iter()
            .map(|b| b.uuid().to_string())
            .collect();
        uuids.push("missing".to_string());
        let err = st.set_metric_batches_sent(&uuids).unwrap_err();
        assert_eq!(err, KeelError::TxnAborted);
        assert_eq!(st.count_of_sent_metrics().unwrap(), 0);
    }

    #[test]
    fn test_metrics_to_send() {
        let (st, clock, unit) = setup();
        let mut batches = add_unsent(&unit, &clock, 3);
        batches[2].set_sent().unwrap();
        assert_eq!(st.metrics_to_send(5).unwrap().len(), 2);
    }

    #[test]
    fn test_metrics_to_send_in_batches() {
        let (st, clock, unit) = setup();
        add_unsent(&unit, &clock, 6);
        for mut batch in add_unsent(&unit, &clock, 4) {
            batch.set_sent().unwrap();
        }
        for _ in 0..3 {
            let result = st.metrics_to_send(2).unwrap();
            assert_eq!(result.len(), 2);
            let uuids: Vec<String> = result.iter().map(|b| b.uuid().to_string()).collect();
            st.set_metric_batches_sent(&uuids).unwrap();
        }
        assert!(st.metrics_to_send(2).unwrap().is_empty());
    }

    #[test]
    fn test_metrics_to_send_oldest_first() {
        let (st, clock, unit) = setup();
        let first = add_unsent(&unit, &clock, 1).remove(0);
        clock.advance(Duration::minutes(5));
        add_unsent(&unit, &clock, 1);
        let result = st.metrics_to_send(1).unwrap();
        assert_eq!(result[0].uuid(), first.uuid());
    }

    #[test]
    fn test_add_bulk_metrics() {
        let (st, clock, _unit) = setup();
        let mut metered = st.add_service("metered", "cs:quantal/metered", &[]).unwrap();
        metered.add_unit().unwrap();
        let now = clock.now();
        let one = |key: &str, value: &str| {
            vec![Metric {
                key: key.to_string(),
                value: value.to_string(),
                time: now,
                credentials: Vec::new(),
            }]
        };

        let mut bulk = BulkMetrics::new();
        bulk.entry("local:quantal/quantal-wordpress-3".to_string())
            .or_default()
            .insert("wordpress/0".to_string(), one("foobar", "123"));
        bulk.entry("cs:quantal/metered".to_string())
            .or_default()
            .insert("metered/0".to_string(), one("barbar", "456"));

        let batches = st.add_bulk_metrics(bulk).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(st.count_of_unsent_metrics().unwrap(), 2);
        assert_eq!(batches[0].unit(), "metered/0");
        assert_eq!(batches[0].charm_url(), "cs:quantal/metered");
        assert_eq!(batches[0].metrics()[0].key, "barbar");
        assert_eq!(batches[0].metrics()[0].value, "456");
        assert_eq!(batches[1].unit(), "wordpress/0");
        assert_eq!(batches[1].metrics()[0].key, "foobar");
        assert_eq!(batches[1].created(), now_to_the_second(st.clock()));
    }

    #[test]
    fn test_add_bulk_metrics_missing_unit_adds_nothing() {
        let (st, clock, _unit) = setup();
        let now = clock.now();
        let mut units = BTreeMap::new();
        units.insert("wordpress/0".to_string(), vec![metric(now)]);
        units.insert("wordpress/7".to_string(), vec![metric(now)]);
        let mut bulk = BulkMetrics::new();
        bulk.insert("local:quantal/quantal-wordpress-3".to_string(), units);

        let err = st.add_bulk_metrics(bulk).unwrap_err();
        assert!(err.is_not_found(), "{:?}", err);
        assert_eq!(st.count_of_unsent_metrics().unwrap(), 0);
    }
}
