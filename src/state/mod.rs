//! Environment-scoped domain model.
//!
//! A [`State`] is bound to one environment uuid. Documents in scoped
//! collections have ids of the form `<uuid>:<local id>`; every transaction
//! submitted through a `State` is checked so it can only touch its own
//! environment's documents.

pub mod environment;
pub mod life;
pub mod meterstatus;
pub mod metrics;
pub mod networks;
pub mod service;
pub mod storage;
pub mod tag;
pub mod unit;
pub mod user;

pub use environment::Environment;
pub use life::Life;
pub use meterstatus::{MeterStatus, MeterStatusCode};
pub use metrics::{BulkMetrics, Metric, MetricBatch};
pub use service::Service;
pub use storage::{StorageAttachment, StorageInstance, StorageKind};
pub use tag::Tag;
pub use unit::Unit;
pub use user::{Principal, User};

use crate::core::error::{KeelError, KeelResult};
use crate::core::time::{Clock, SystemClock};
use crate::store::{Document, Store};
use crate::txn::{Operation, TxnPlan, TxnRunner, TxnStatsSnapshot, DEFAULT_MAX_ATTEMPTS};
use crate::watch::WatchHub;
use std::sync::Arc;

/// Collection names.
pub mod collections {
    pub const ENVIRONMENTS: &str = "environments";
    pub const USERS: &str = "users";
    pub const SERVICES: &str = "services";
    pub const UNITS: &str = "units";
    pub const METER_STATUS: &str = "meterStatus";
    pub const METRICS: &str = "metrics";
    pub const REQUESTED_NETWORKS: &str = "requestedNetworks";
    pub const STORAGE_INSTANCES: &str = "storageInstances";
    pub const STORAGE_ATTACHMENTS: &str = "storageAttachments";
    pub const SEQUENCES: &str = "sequences";

    /// Collections whose ids are not environment-prefixed.
    pub fn is_global(collection: &str) -> bool {
        collection == ENVIRONMENTS
    }
}

/// Options for opening a [`State`].
#[derive(Clone)]
pub struct StateOptions {
    pub max_attempts: u32,
    pub clock: Arc<dyn Clock>,
    pub hub: Arc<WatchHub>,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            clock: Arc::new(SystemClock),
            hub: Arc::new(WatchHub::new()),
        }
    }
}

struct Inner {
    env_uuid: String,
    store: Arc<dyn Store>,
    runner: TxnRunner,
    clock: Arc<dyn Clock>,
}

/// Handle on one environment's state. Cheap to clone.
#[derive(Clone)]
pub struct State {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("env_uuid", &self.inner.env_uuid)
            .field("runner", &self.inner.runner)
            .finish()
    }
}

impl State {
    /// Bind to an environment. The environment need not exist yet.
    pub fn open(store: Arc<dyn Store>, env_uuid: impl Into<String>, options: StateOptions) -> Self {
        let runner = TxnRunner::new(store.clone(), options.hub).with_max_attempts(options.max_attempts);
        Self {
            inner: Arc::new(Inner {
                env_uuid: env_uuid.into(),
                store,
                runner,
                clock: options.clock,
            }),
        }
    }

    pub fn env_uuid(&self) -> &str {
        &self.inner.env_uuid
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn hub(&self) -> &Arc<WatchHub> {
        self.inner.runner.hub()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.inner.clock.as_ref()
    }

    pub fn txn_stats(&self) -> TxnStatsSnapshot {
        self.inner.runner.stats()
    }

    /// `<uuid>:<local>`.
    pub fn doc_id(&self, local: &str) -> String {
        format!("{}:{}", self.inner.env_uuid, local)
    }

    /// Strip this environment's prefix from a document id.
    pub fn local_id<'a>(&self, id: &'a str) -> &'a str {
        id.strip_prefix(self.inner.env_uuid.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(id)
    }

    /// Check the backing store.
    pub fn ping(&self) -> KeelResult<()> {
        self.inner.store.ping()
    }

    /// Run a transaction builder against this environment.
    ///
    /// Fails with `NotFound` before the builder runs if the environment does
    /// not exist. Operations naming another environment's documents are
    /// rejected with `InvalidRequest` without reaching the store.
    pub fn run<F>(&self, mut build: F) -> KeelResult<()>
    where
        F: FnMut(u32) -> KeelResult<TxnPlan>,
    {
        self.environment()?;
        self.inner.runner.run(|attempt| {
            let plan = build(attempt)?;
            if let TxnPlan::Apply(ops) = &plan {
                self.check_scope(ops)?;
            }
            Ok(plan)
        })
    }

    /// Submit one fixed operation list exactly once.
    pub fn run_ops(&self, ops: Vec<Operation>) -> KeelResult<()> {
        self.check_scope(&ops)?;
        self.inner.runner.run_ops(ops)
    }

    fn check_scope(&self, ops: &[Operation]) -> KeelResult<()> {
        for op in ops {
            if collections::is_global(&op.collection) {
                if op.collection == collections::ENVIRONMENTS && op.id != self.inner.env_uuid {
                    return Err(KeelError::invalid(format!(
                        "cannot touch environment {:?} from environment {:?}",
                        op.id, self.inner.env_uuid
                    )));
                }
                continue;
            }
            let in_scope = op
                .id
                .strip_prefix(self.inner.env_uuid.as_str())
                .is_some_and(|rest| rest.starts_with(':'));
            if !in_scope {
                return Err(KeelError::invalid(format!(
                    "document {:?} in {} is outside environment {:?}",
                    op.id, op.collection, self.inner.env_uuid
                )));
            }
        }
        Ok(())
    }

    /// Fetch a scoped document by local id.
    pub(crate) fn fetch(&self, collection: &str, local: &str) -> KeelResult<Option<Document>> {
        self.inner.store.fetch(collection, &self.doc_id(local))
    }

    /// Scan a scoped collection by local id prefix.
    pub(crate) fn scan(&self, collection: &str, local_prefix: &str) -> KeelResult<Vec<Document>> {
        self.inner.store.scan(collection, &self.doc_id(local_prefix))
    }
}
