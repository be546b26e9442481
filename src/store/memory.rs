//! In-memory document store.
//!
//! [`Tables`] holds the collections and implements staging: assertions are
//! checked against the committed state, then mutations are applied in order
//! to an overlay so later operations see the effects of earlier ones. Nothing
//! touches the tables until the whole list has staged cleanly.

use super::{Change, ChangeKind, Commit, Document, Store};
use crate::core::error::{KeelError, KeelResult};
use crate::txn::op::{Mutation, Operation};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

/// Final state of one document after a staged commit.
#[derive(Debug, Clone)]
pub(crate) struct StagedWrite {
    pub collection: String,
    pub id: String,
    /// `None` removes the document.
    pub doc: Option<Document>,
}

/// A commit that passed staging and is ready to install.
#[derive(Debug, Clone)]
pub(crate) struct Staged {
    pub revision: u64,
    pub writes: Vec<StagedWrite>,
    pub changes: Vec<Change>,
}

/// Committed collections.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    collections: HashMap<String, BTreeMap<String, Document>>,
    revision: u64,
}

impl Tables {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<&Document> {
        self.collections.get(collection).and_then(|c| c.get(id))
    }

    pub fn scan(&self, collection: &str, id_prefix: &str) -> Vec<Document> {
        let Some(docs) = self.collections.get(collection) else {
            return Vec::new();
        };
        docs.range(id_prefix.to_string()..)
            .take_while(|(id, _)| id.starts_with(id_prefix))
            .map(|(_, doc)| doc.clone())
            .collect()
    }

    /// Stage an operation list against the committed state.
    pub fn stage(&self, ops: &[Operation]) -> KeelResult<Staged> {
        for op in ops {
            if !op.assertion.holds(self.get(&op.collection, &op.id)) {
                tracing::trace!(
                    collection = %op.collection,
                    id = %op.id,
                    assertion = ?op.assertion,
                    "assertion failed"
                );
                return Err(KeelError::TxnAborted);
            }
        }

        let revision = self.revision + 1;
        let mut overlay: HashMap<(String, String), Option<Document>> = HashMap::new();
        let mut order: Vec<(String, String)> = Vec::new();
        let mut changes = Vec::new();

        for op in ops {
            let key = (op.collection.clone(), op.id.clone());
            let current = match overlay.get(&key) {
                Some(doc) => doc.clone(),
                None => self.get(&op.collection, &op.id).cloned(),
            };

            let (next, kind) = match &op.mutation {
                Mutation::None => continue,
                Mutation::Insert(fields) => {
                    if current.is_some() {
                        return Err(KeelError::TxnAborted);
                    }
                    (
                        Some(Document::new(op.id.clone(), revision, fields.clone())),
                        ChangeKind::Inserted,
                    )
                }
                Mutation::Set(fields) => {
                    let mut doc = current.ok_or(KeelError::TxnAborted)?;
                    for (name, value) in fields {
                        doc.fields.insert(name.clone(), value.clone());
                    }
                    doc.version += 1;
                    doc.revision = revision;
                    (Some(doc), ChangeKind::Updated)
                }
                Mutation::Unset(names) => {
                    let mut doc = current.ok_or(KeelError::TxnAborted)?;
                    for name in names {
                        doc.fields.remove(name);
                    }
                    doc.version += 1;
                    doc.revision = revision;
                    (Some(doc), ChangeKind::Updated)
                }
                Mutation::Remove => match current {
                    Some(_) => (None, ChangeKind::Removed),
                    None => continue,
                },
            };

            if !overlay.contains_key(&key) {
                order.push(key.clone());
            }
            overlay.insert(key, next);
            changes.push(Change {
                collection: op.collection.clone(),
                id: op.id.clone(),
                revision,
                kind,
            });
        }

        let writes = order
            .into_iter()
            .map(|key| {
                let doc = overlay.remove(&key).flatten();
                StagedWrite {
                    collection: key.0,
                    id: key.1,
                    doc,
                }
            })
            .collect();

        Ok(Staged {
            revision,
            writes,
            changes,
        })
    }

    /// Install staged writes and advance the revision.
    pub fn install(&mut self, revision: u64, writes: Vec<StagedWrite>) {
        for write in writes {
            let collection = self.collections.entry(write.collection).or_default();
            match write.doc {
                Some(doc) => {
                    collection.insert(write.id, doc);
                }
                None => {
                    collection.remove(&write.id);
                }
            }
        }
        self.revision = revision;
    }
}

/// In-memory [`Store`].
#[derive(Debug)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    commit_lock: Mutex<()>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            commit_lock: Mutex::new(()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing or regaining the backing store.
    ///
    /// While unavailable, `ping` and `apply` fail with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> KeelResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KeelError::store_unavailable("memory store offline"))
        }
    }
}

impl Store for MemoryStore {
    fn apply(&self, ops: &[Operation]) -> KeelResult<Commit> {
        self.check_available()?;
        let _commit = self.commit_lock.lock();
        let staged = self.tables.read().stage(ops)?;
        let Staged {
            revision,
            writes,
            changes,
        } = staged;
        self.tables.write().install(revision, writes);
        Ok(Commit { revision, changes })
    }

    fn fetch(&self, collection: &str, id: &str) -> KeelResult<Option<Document>> {
        Ok(self.tables.read().get(collection, id).cloned())
    }

    fn scan(&self, collection: &str, id_prefix: &str) -> KeelResult<Vec<Document>> {
        Ok(self.tables.read().scan(collection, id_prefix))
    }

    fn ping(&self) -> KeelResult<()> {
        self.check_available()
    }

    fn revision(&self) -> u64 {
        self.tables.read().revision()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::op::{Assertion, Predicate};
    use serde_json::json;

    fn fields(value: serde_json::Value) -> super::super::Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_insert_and_fetch() {
        let store = MemoryStore::new();
        let commit = store
            .apply(&[Operation::new("units", "u1")
                .assert(Assertion::DocMissing)
                .insert(fields(json!({"life": "alive"})))])
            .unwrap();

        assert_eq!(commit.revision, 1);
        assert_eq!(commit.changes[0].kind, ChangeKind::Inserted);

        let doc = store.fetch("units", "u1").unwrap().unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.revision, 1);
        assert_eq!(doc.get("life"), Some(&json!("alive")));
    }

    #[test]
    fn test_failed_assertion_leaves_state_untouched() {
        let store = MemoryStore::new();
        store
            .apply(&[Operation::new("units", "u1").insert(fields(json!({"life": "alive"})))])
            .unwrap();

        let err = store
            .apply(&[
                Operation::new("units", "u2").insert(fields(json!({"life": "alive"}))),
                Operation::new("units", "u1")
                    .assert(Assertion::Matches(Predicate::eq("life", "dead")))
                    .remove(),
            ])
            .unwrap_err();

        assert_eq!(err, KeelError::TxnAborted);
        assert!(store.fetch("units", "u2").unwrap().is_none());
        assert_eq!(store.revision(), 1);
    }

    #[test]
    fn test_staging_failure_aborts_whole_list() {
        let store = MemoryStore::new();
        let err = store
            .apply(&[
                Operation::new("units", "u1").insert(fields(json!({"a": 1}))),
                Operation::new("units", "missing").set(fields(json!({"a": 2}))),
            ])
            .unwrap_err();

        assert_eq!(err, KeelError::TxnAborted);
        assert!(store.fetch("units", "u1").unwrap().is_none());
    }

    #[test]
    fn test_later_ops_see_earlier_effects() {
        let store = MemoryStore::new();
        store
            .apply(&[
                Operation::new("units", "u1").insert(fields(json!({"a": 1, "b": 2}))),
                Operation::new("units", "u1").set(fields(json!({"a": 3}))),
                Operation::new("units", "u1").unset(vec!["b".to_string()]),
            ])
            .unwrap();

        let doc = store.fetch("units", "u1").unwrap().unwrap();
        assert_eq!(doc.version, 3);
        assert_eq!(doc.get("a"), Some(&json!(3)));
        assert!(doc.get("b").is_none());
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let store = MemoryStore::new();
        let commit = store
            .apply(&[Operation::new("units", "ghost").remove()])
            .unwrap();
        assert!(commit.changes.is_empty());
    }

    #[test]
    fn test_scan_prefix() {
        let store = MemoryStore::new();
        store
            .apply(&[
                Operation::new("units", "env-a:wordpress/0").insert(fields(json!({}))),
                Operation::new("units", "env-a:wordpress/1").insert(fields(json!({}))),
                Operation::new("units", "env-b:wordpress/0").insert(fields(json!({}))),
            ])
            .unwrap();

        let docs = store.scan("units", "env-a:").unwrap();
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["env-a:wordpress/0", "env-a:wordpress/1"]);
        assert!(store.scan("services", "").unwrap().is_empty());
    }

    #[test]
    fn test_unavailable_store() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(store.ping().unwrap_err().is_fatal());
        assert!(store
            .apply(&[Operation::new("units", "u1").insert(fields(json!({})))])
            .is_err());

        store.set_available(true);
        assert!(store.ping().is_ok());
    }
}
