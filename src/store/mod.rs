//! Document store boundary.
//!
//! The store holds named collections of JSON documents and commits ordered
//! operation lists atomically. Every successful commit is stamped with one
//! new store revision.
//!
//! Two backends are provided:
//! - [`MemoryStore`] keeps everything in memory (tests and ephemeral runs)
//! - [`JournalStore`] keeps the same tables in memory and appends every
//!   commit to an fsynced journal that is replayed on open

pub mod journal;
pub mod memory;

pub use journal::JournalStore;
pub use memory::MemoryStore;

use crate::core::error::{KeelError, KeelResult};
use crate::txn::op::Operation;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field map carried by a document.
pub type Fields = Map<String, Value>;

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id, unique within its collection.
    pub id: String,

    /// Store revision of the last commit that touched this document.
    pub revision: u64,

    /// Number of mutations applied to this document (1 after insert).
    pub version: u64,

    /// Document body.
    pub fields: Fields,
}

impl Document {
    /// Create a freshly inserted document.
    pub fn new(id: impl Into<String>, revision: u64, fields: Fields) -> Self {
        Self {
            id: id.into(),
            revision,
            version: 1,
            fields,
        }
    }

    /// Look up a top-level field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Decode the body into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> KeelResult<T> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|e| {
            KeelError::internal(format!("cannot decode document {:?}: {}", self.id, e))
        })
    }
}

/// Encode a typed record into a field map.
pub fn encode_fields<T: Serialize>(record: &T) -> KeelResult<Fields> {
    match serde_json::to_value(record) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(KeelError::internal(format!(
            "document body must be an object, got {}",
            other
        ))),
        Err(e) => Err(KeelError::internal(format!("cannot encode document: {}", e))),
    }
}

/// Kind of change applied to one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Inserted,
    Updated,
    Removed,
}

/// A committed change to one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub collection: String,
    pub id: String,
    pub revision: u64,
    pub kind: ChangeKind,
}

/// Result of a successful commit.
#[derive(Debug, Clone, Default)]
pub struct Commit {
    /// Revision stamped on the commit.
    pub revision: u64,

    /// Changes in operation order.
    pub changes: Vec<Change>,
}

/// Store capability used by the transaction engine.
///
/// `apply` commits all operations or none. Assertions are evaluated against
/// the state before the commit; an assertion or staging failure reports
/// [`KeelError::TxnAborted`] and leaves the store untouched. `apply` returns
/// only once the commit is durable.
pub trait Store: Send + Sync {
    /// Atomically commit an ordered operation list.
    fn apply(&self, ops: &[Operation]) -> KeelResult<Commit>;

    /// Read one document.
    fn fetch(&self, collection: &str, id: &str) -> KeelResult<Option<Document>>;

    /// Read every document whose id starts with `id_prefix`, in id order.
    fn scan(&self, collection: &str, id_prefix: &str) -> KeelResult<Vec<Document>>;

    /// Check that the store is reachable.
    fn ping(&self) -> KeelResult<()>;

    /// Revision of the last commit.
    fn revision(&self) -> u64;
}
