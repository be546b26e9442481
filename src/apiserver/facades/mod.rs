//! Domain facades.
//!
//! Bulk requests take a list of entities and answer with one result per
//! entity, in order. A failure for one entity is reported in its result and
//! does not fail the request.

pub mod meterstatus;
pub mod metrics;
pub mod networks;
pub mod pinger;
pub mod storage;
pub mod watcher;

pub use meterstatus::MeterStatusFacade;
pub use metrics::MetricsFacade;
pub use networks::NetworksFacade;
pub use pinger::PingerFacade;
pub use storage::StorageFacade;
pub use watcher::WatcherFacade;

use super::envelope::WireError;
use super::facade::{CallContext, Registry};
use crate::core::error::{KeelError, KeelResult};
use crate::state::{Tag, Unit};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An entity named by tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub tag: String,
}

/// Parameters naming a list of entities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entities {
    #[serde(default)]
    pub entities: Vec<Entity>,
}

/// Outcome of one entity in a bulk request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ErrorResult {
    pub fn from_result<T>(result: KeelResult<T>) -> Self {
        Self {
            error: result.err().map(|e| WireError::from(&e)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorResults {
    pub results: Vec<ErrorResult>,
}

impl FromIterator<KeelResult<()>> for ErrorResults {
    fn from_iter<I: IntoIterator<Item = KeelResult<()>>>(iter: I) -> Self {
        Self {
            results: iter.into_iter().map(ErrorResult::from_result).collect(),
        }
    }
}

/// Resolve a unit tag the caller may access.
///
/// Inaccessible and missing units both read as `PermissionDenied` so
/// callers cannot probe for units they do not own.
pub(crate) fn accessible_unit(ctx: &CallContext, tag: &str) -> KeelResult<Unit> {
    let tag = Tag::parse(tag)?;
    let Tag::Unit(name) = &tag else {
        return Err(KeelError::invalid(format!("{} is not a unit tag", tag)));
    };
    ctx.check_access(&tag)?;
    match ctx.state.unit(name) {
        Ok(unit) => Ok(unit),
        Err(e) if e.is_not_found() && !ctx.principal.is_user() => Err(KeelError::PermissionDenied),
        Err(e) => Err(e),
    }
}

impl Registry {
    /// A registry serving every built-in facade.
    pub fn with_default_facades() -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(PingerFacade))
            .register(Arc::new(MeterStatusFacade))
            .register(Arc::new(MetricsFacade))
            .register(Arc::new(StorageFacade))
            .register(Arc::new(NetworksFacade))
            .register(Arc::new(WatcherFacade));
        registry
    }
}
