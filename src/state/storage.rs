//! Storage instances and their unit attachments.
//!
//! Instances are named `<store>/<n>` with `n` drawn from a per-store
//! sequence. An attachment binds one instance to one unit at a location
//! and is identified by `<unit>#<storage>`, so a unit's attachments share
//! an id prefix.

use super::collections::{SEQUENCES, SERVICES, STORAGE_ATTACHMENTS, STORAGE_INSTANCES, UNITS};
use super::life::{self, Life};
use super::tag::Tag;
use super::State;
use crate::core::error::{KeelError, KeelResult};
use crate::store::{encode_fields, Document};
use crate::txn::{fields, Assertion, Operation, Predicate, TxnPlan};
use serde::{Deserialize, Serialize};

/// Kind of storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Block,
    Filesystem,
}

impl StorageKind {
    pub fn parse(kind: &str) -> KeelResult<Self> {
        match kind {
            "block" => Ok(Self::Block),
            "filesystem" => Ok(Self::Filesystem),
            other => Err(KeelError::invalid(format!("invalid storage kind {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StorageInstanceDoc {
    id: String,
    name: String,
    kind: StorageKind,
    owner: String,
    life: Life,
}

/// A storage instance.
#[derive(Debug, Clone)]
pub struct StorageInstance {
    doc: StorageInstanceDoc,
}

impl StorageInstance {
    pub fn id(&self) -> &str {
        &self.doc.id
    }

    /// Store name the instance was allocated from.
    pub fn name(&self) -> &str {
        &self.doc.name
    }

    pub fn kind(&self) -> StorageKind {
        self.doc.kind
    }

    pub fn owner(&self) -> &str {
        &self.doc.owner
    }

    pub fn life(&self) -> Life {
        self.doc.life
    }

    pub fn tag(&self) -> Tag {
        Tag::Storage(self.doc.id.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StorageAttachmentDoc {
    storage: String,
    unit: String,
    owner: String,
    kind: StorageKind,
    location: String,
    life: Life,
}

/// A storage instance attached to a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAttachment {
    pub storage_tag: String,
    pub owner_tag: String,
    pub unit_tag: String,
    pub kind: StorageKind,
    pub location: String,
    pub life: Life,
}

impl StorageAttachment {
    fn from_doc(doc: &Document) -> KeelResult<Self> {
        let doc: StorageAttachmentDoc = doc.decode()?;
        Ok(Self {
            storage_tag: Tag::Storage(doc.storage).to_string(),
            owner_tag: doc.owner,
            unit_tag: Tag::Unit(doc.unit).to_string(),
            kind: doc.kind,
            location: doc.location,
            life: doc.life,
        })
    }
}

fn attachment_key(storage_id: &str, unit: &str) -> String {
    format!("{}#{}", unit, storage_id)
}

impl State {
    /// Allocate a storage instance owned by a unit or service.
    pub fn add_storage_instance(
        &self,
        owner_tag: &str,
        name: &str,
        kind: StorageKind,
    ) -> KeelResult<StorageInstance> {
        if name.is_empty() || name.contains('/') || name.contains('#') {
            return Err(KeelError::invalid(format!("invalid storage name {:?}", name)));
        }
        let owner = Tag::parse(owner_tag)?;
        let owner_op = match &owner {
            Tag::Unit(unit) => Operation::new(UNITS, self.doc_id(unit)).assert(life::is_alive()),
            Tag::Service(service) => self.service_alive_op(service),
            other => {
                return Err(KeelError::invalid(format!(
                    "{} cannot own storage",
                    other
                )))
            }
        };
        let seq_local = format!("storage-{}", name);
        let mut created = String::new();

        self.run(|_| {
            let owner_doc = match &owner {
                Tag::Unit(unit) => self.fetch(UNITS, unit)?,
                _ => self.fetch(SERVICES, owner.id())?,
            };
            match owner_doc {
                Some(doc) if doc.get("life").and_then(|v| v.as_str()) == Some("alive") => {}
                _ => return Err(KeelError::not_found(owner.to_string())),
            }

            let (seq, seq_op) = match self.fetch(SEQUENCES, &seq_local)? {
                Some(doc) => {
                    let counter = doc.get("counter").and_then(|v| v.as_u64()).unwrap_or(0);
                    (
                        counter,
                        Operation::new(SEQUENCES, doc.id.clone())
                            .assert(Assertion::Matches(Predicate::Version(doc.version)))
                            .set(fields([("counter", counter + 1)])),
                    )
                }
                None => (
                    0,
                    Operation::new(SEQUENCES, self.doc_id(&seq_local))
                        .assert(Assertion::DocMissing)
                        .insert(fields([("counter", 1u64)])),
                ),
            };

            created = format!("{}/{}", name, seq);
            let doc = StorageInstanceDoc {
                id: created.clone(),
                name: name.to_string(),
                kind,
                owner: owner.to_string(),
                life: Life::Alive,
            };
            Ok(TxnPlan::Apply(vec![
                owner_op.clone(),
                seq_op,
                Operation::new(STORAGE_INSTANCES, self.doc_id(&created))
                    .assert(Assertion::DocMissing)
                    .insert(encode_fields(&doc)?),
            ]))
        })
        .map_err(|e| e.annotate(format!("cannot add storage {:?}", name)))?;

        tracing::debug!(storage = %created, owner = %owner, "storage instance added");
        self.storage_instance(&created)
    }

    /// Look up a storage instance by id (`data/0`).
    pub fn storage_instance(&self, id: &str) -> KeelResult<StorageInstance> {
        let doc = self
            .fetch(STORAGE_INSTANCES, id)?
            .ok_or_else(|| KeelError::not_found(format!("storage instance {:?}", id)))?;
        Ok(StorageInstance { doc: doc.decode()? })
    }

    /// Attach a storage instance to a unit.
    pub fn attach_storage(
        &self,
        storage_id: &str,
        unit: &str,
        location: &str,
    ) -> KeelResult<StorageAttachment> {
        let key = attachment_key(storage_id, unit);
        self.run(|_| {
            let instance = self.storage_instance(storage_id)?;
            if instance.life() != Life::Alive {
                return Err(KeelError::invalid(format!(
                    "storage instance {:?} is not alive",
                    storage_id
                )));
            }
            let unit_doc = self
                .fetch(UNITS, unit)?
                .ok_or_else(|| KeelError::not_found(format!("unit {:?}", unit)))?;
            if unit_doc.get("life").and_then(|v| v.as_str()) != Some(Life::Alive.as_str()) {
                return Err(KeelError::invalid(format!("unit {:?} is not alive", unit)));
            }
            if self.fetch(STORAGE_ATTACHMENTS, &key)?.is_some() {
                return Err(KeelError::already_exists(format!(
                    "storage attachment {} to {}",
                    storage_id, unit
                )));
            }

            let doc = StorageAttachmentDoc {
                storage: storage_id.to_string(),
                unit: unit.to_string(),
                owner: instance.owner().to_string(),
                kind: instance.kind(),
                location: location.to_string(),
                life: Life::Alive,
            };
            Ok(TxnPlan::Apply(vec![
                Operation::new(STORAGE_INSTANCES, self.doc_id(storage_id)).assert(life::is_alive()),
                Operation::new(UNITS, self.doc_id(unit)).assert(life::is_alive()),
                Operation::new(STORAGE_ATTACHMENTS, self.doc_id(&key))
                    .assert(Assertion::DocMissing)
                    .insert(encode_fields(&doc)?),
            ]))
        })
        .map_err(|e| e.annotate(format!("cannot attach storage {:?} to unit {:?}", storage_id, unit)))?;

        self.storage_attachment(storage_id, unit)
    }

    /// Look up one attachment.
    pub fn storage_attachment(&self, storage_id: &str, unit: &str) -> KeelResult<StorageAttachment> {
        let doc = self
            .fetch(STORAGE_ATTACHMENTS, &attachment_key(storage_id, unit))?
            .ok_or_else(|| {
                KeelError::not_found(format!("storage attachment {} to {}", storage_id, unit))
            })?;
        StorageAttachment::from_doc(&doc)
    }

    /// Attachments of a unit.
    pub fn unit_storage_attachments(&self, unit: &str) -> KeelResult<Vec<StorageAttachment>> {
        self.scan(STORAGE_ATTACHMENTS, &format!("{}#", unit))?
            .iter()
            .map(StorageAttachment::from_doc)
            .collect()
    }

    /// Mark an attachment dead. No-op if already dead.
    pub fn ensure_storage_attachment_dead(&self, storage_id: &str, unit: &str) -> KeelResult<()> {
        let key = attachment_key(storage_id, unit);
        self.run(|_| {
            let current = self.storage_attachment(storage_id, unit)?;
            if current.life == Life::Dead {
                return Ok(TxnPlan::NoChange);
            }
            Ok(TxnPlan::Apply(vec![Operation::new(STORAGE_ATTACHMENTS, self.doc_id(&key))
                .assert(life::not_dead())
                .set(fields([("life", Life::Dead.as_str())]))]))
        })
    }

    /// Remove a dead attachment.
    pub fn remove_storage_attachment(&self, storage_id: &str, unit: &str) -> KeelResult<()> {
        let key = attachment_key(storage_id, unit);
        self.run(|_| {
            let current = match self.storage_attachment(storage_id, unit) {
                Ok(current) => current,
                Err(e) if e.is_not_found() => return Ok(TxnPlan::NoChange),
                Err(e) => return Err(e),
            };
            if current.life != Life::Dead {
                return Err(KeelError::invalid(format!(
                    "cannot remove storage attachment {} to {}: attachment is not dead",
                    storage_id, unit
                )));
            }
            Ok(TxnPlan::Apply(vec![Operation::new(STORAGE_ATTACHMENTS, self.doc_id(&key))
                .assert(life::is_dead())
                .remove()]))
        })
    }

    /// Detach storage from a unit: mark the attachment dead and remove it.
    pub fn detach_storage(&self, storage_id: &str, unit: &str) -> KeelResult<()> {
        self.ensure_storage_attachment_dead(storage_id, unit)?;
        self.remove_storage_attachment(storage_id, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateOptions;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn state() -> State {
        let st = State::open(Arc::new(MemoryStore::new()), "env-1", StateOptions::default());
        st.initialize("test", "admin", "pw").unwrap();
        let mut svc = st.add_service("mysql", "cs:mysql-1", &[]).unwrap();
        svc.add_unit().unwrap();
        st
    }

    #[test]
    fn test_instance_ids_sequence() {
        let st = state();
        let a = st
            .add_storage_instance("service-mysql", "data", StorageKind::Block)
            .unwrap();
        let b = st
            .add_storage_instance("unit-mysql-0", "data", StorageKind::Filesystem)
            .unwrap();
        assert_eq!(a.id(), "data/0");
        assert_eq!(b.id(), "data/1");
        assert_eq!(a.tag().to_string(), "storage-data-0");
        assert_eq!(b.owner(), "unit-mysql-0");

        assert!(st
            .add_storage_instance("service-ghost", "data", StorageKind::Block)
            .unwrap_err()
            .is_not_found());
        assert!(st
            .add_storage_instance("user-admin", "data", StorageKind::Block)
            .is_err());
    }

    #[test]
    fn test_attach_list_detach() {
        let st = state();
        st.add_storage_instance("service-mysql", "data", StorageKind::Block)
            .unwrap();

        let attachment = st.attach_storage("data/0", "mysql/0", "/dev/sda").unwrap();
        assert_eq!(
            attachment,
            StorageAttachment {
                storage_tag: "storage-data-0".to_string(),
                owner_tag: "service-mysql".to_string(),
                unit_tag: "unit-mysql-0".to_string(),
                kind: StorageKind::Block,
                location: "/dev/sda".to_string(),
                life: Life::Alive,
            }
        );

        let err = st.attach_storage("data/0", "mysql/0", "/dev/sdb").unwrap_err();
        assert!(matches!(err, KeelError::AlreadyExists { .. }));

        assert_eq!(st.unit_storage_attachments("mysql/0").unwrap().len(), 1);
        assert!(st.unit_storage_attachments("mysql/1").unwrap().is_empty());

        assert!(st.remove_storage_attachment("data/0", "mysql/0").is_err());
        st.detach_storage("data/0", "mysql/0").unwrap();
        assert!(st.unit_storage_attachments("mysql/0").unwrap().is_empty());
        assert!(st
            .storage_attachment("data/0", "mysql/0")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_attach_to_dead_unit_fails() {
        let st = state();
        st.add_storage_instance("service-mysql", "data", StorageKind::Block)
            .unwrap();
        st.unit("mysql/0").unwrap().ensure_dead().unwrap();
        assert!(st.attach_storage("data/0", "mysql/0", "/dev/sda").is_err());
    }
}
