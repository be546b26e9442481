//! Units.

use super::collections::{SERVICES, UNITS};
use super::life::{self, Life};
use super::meterstatus::remove_meter_status_op;
use super::service::ServiceDoc;
use super::tag::Tag;
use super::user::{new_salt, password_hash, password_matches};
use super::State;
use crate::core::error::{KeelError, KeelResult};
use crate::store::Document;
use crate::txn::{fields, Assertion, Operation, Predicate, TxnPlan};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct UnitDoc {
    pub name: String,
    pub service: String,
    pub charm_url: String,
    pub life: Life,
    #[serde(default)]
    pub password_hash: String,
    #[serde(default)]
    pub password_salt: String,
}

impl UnitDoc {
    pub fn new(name: &str, service: &str, charm_url: &str) -> Self {
        Self {
            name: name.to_string(),
            service: service.to_string(),
            charm_url: charm_url.to_string(),
            life: Life::Alive,
            password_hash: String::new(),
            password_salt: String::new(),
        }
    }
}

/// A unit of a service.
#[derive(Debug, Clone)]
pub struct Unit {
    pub(crate) st: State,
    doc: UnitDoc,
}

impl Unit {
    pub(crate) fn from_doc(st: &State, doc: Document) -> KeelResult<Self> {
        Ok(Self {
            st: st.clone(),
            doc: doc.decode()?,
        })
    }

    pub fn name(&self) -> &str {
        &self.doc.name
    }

    pub fn service_name(&self) -> &str {
        &self.doc.service
    }

    pub fn charm_url(&self) -> &str {
        &self.doc.charm_url
    }

    pub fn life(&self) -> Life {
        self.doc.life
    }

    pub fn tag(&self) -> Tag {
        Tag::Unit(self.doc.name.clone())
    }

    /// Scoped document id of this unit.
    pub(crate) fn doc_id(&self) -> String {
        self.st.doc_id(&self.doc.name)
    }

    /// Assert this unit exists and is alive.
    pub(crate) fn alive_op(&self) -> Operation {
        Operation::new(UNITS, self.doc_id()).assert(life::is_alive())
    }

    /// Assert this unit exists and is not dead.
    pub(crate) fn not_dead_op(&self) -> Operation {
        Operation::new(UNITS, self.doc_id()).assert(life::not_dead())
    }

    /// Reload from the store. Fails with `NotFound` once removed.
    pub fn refresh(&mut self) -> KeelResult<()> {
        *self = self.st.unit(&self.doc.name)?;
        Ok(())
    }

    pub fn password_valid(&self, password: &str) -> bool {
        password_matches(password, &self.doc.password_salt, &self.doc.password_hash)
    }

    /// Set the agent password for this unit.
    pub fn set_password(&mut self, password: &str) -> KeelResult<()> {
        if password.len() < 8 {
            return Err(KeelError::invalid(format!(
                "password is only {} bytes long, and is not a valid agent password",
                password.len()
            ))
            .annotate(format!("cannot set password of unit {:?}", self.doc.name)));
        }
        let salt = new_salt();
        let hash = password_hash(password, &salt);
        self.st
            .run_ops(vec![self
                .not_dead_op()
                .set(fields([
                    ("password_hash", hash.clone()),
                    ("password_salt", salt.clone()),
                ]))])
            .map_err(|e| match e {
                KeelError::TxnAborted => KeelError::not_found(format!("unit {:?}", self.doc.name)),
                other => other,
            })?;
        self.doc.password_hash = hash;
        self.doc.password_salt = salt;
        Ok(())
    }

    /// Mark the unit dead. No-op if it is already dead or removed.
    pub fn ensure_dead(&mut self) -> KeelResult<()> {
        let st = self.st.clone();
        st.run(|attempt| {
            if attempt > 0 {
                match self.refresh() {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => return Ok(TxnPlan::NoChange),
                    Err(e) => return Err(e),
                }
            }
            if self.doc.life == Life::Dead {
                return Ok(TxnPlan::NoChange);
            }
            Ok(TxnPlan::Apply(vec![self
                .not_dead_op()
                .set(fields([("life", Life::Dead.as_str())]))]))
        })
        .map_err(|e| e.annotate(format!("cannot ensure unit {:?} is dead", self.doc.name)))?;
        self.doc.life = Life::Dead;
        Ok(())
    }

    /// Remove a dead unit along with its meter status.
    pub fn remove(&mut self) -> KeelResult<()> {
        if self.doc.life != Life::Dead {
            return Err(KeelError::invalid(format!(
                "cannot remove unit {:?}: unit is not dead",
                self.doc.name
            )));
        }
        let st = self.st.clone();
        st.run(|attempt| {
            if attempt > 0 {
                match self.refresh() {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => return Ok(TxnPlan::NoChange),
                    Err(e) => return Err(e),
                }
            }
            let mut ops = vec![
                Operation::new(UNITS, self.doc_id())
                    .assert(life::is_dead())
                    .remove(),
                remove_meter_status_op(&st, &self.doc.name),
            ];
            if let Some(doc) = st.fetch(SERVICES, &self.doc.service)? {
                let svc: ServiceDoc = doc.decode()?;
                ops.push(
                    Operation::new(SERVICES, doc.id.clone())
                        .assert(Assertion::Matches(Predicate::Version(doc.version)))
                        .set(fields([("unit_count", svc.unit_count.saturating_sub(1))])),
                );
            }
            Ok(TxnPlan::Apply(ops))
        })
        .map_err(|e| e.annotate(format!("cannot remove unit {:?}", self.doc.name)))?;
        tracing::debug!(unit = %self.doc.name, "unit removed");
        Ok(())
    }
}

impl State {
    /// Look up a unit.
    pub fn unit(&self, name: &str) -> KeelResult<Unit> {
        let doc = self
            .fetch(UNITS, name)?
            .ok_or_else(|| KeelError::not_found(format!("unit {:?}", name)))?;
        Unit::from_doc(self, doc)
    }

    /// Every unit in the environment.
    pub fn all_units(&self) -> KeelResult<Vec<Unit>> {
        self.scan(UNITS, "")?
            .into_iter()
            .map(|doc| Unit::from_doc(self, doc))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateOptions;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn state_with_unit() -> (State, Unit) {
        let st = State::open(Arc::new(MemoryStore::new()), "env-1", StateOptions::default());
        st.initialize("test", "admin", "pw").unwrap();
        let mut svc = st.add_service("wordpress", "cs:wordpress-3", &[]).unwrap();
        let unit = svc.add_unit().unwrap();
        (st, unit)
    }

    #[test]
    fn test_lifecycle() {
        let (st, mut unit) = state_with_unit();
        assert_eq!(unit.life(), Life::Alive);
        assert!(unit.remove().is_err());

        unit.ensure_dead().unwrap();
        unit.ensure_dead().unwrap();
        unit.refresh().unwrap();
        assert_eq!(unit.life(), Life::Dead);

        unit.remove().unwrap();
        assert!(unit.refresh().unwrap_err().is_not_found());
        assert!(st.all_units().unwrap().is_empty());
        assert_eq!(st.service("wordpress").unwrap().unit_count(), 0);

        // Removing again is a no-op.
        unit.remove().unwrap();
    }

    #[test]
    fn test_unit_password_login() {
        let (st, mut unit) = state_with_unit();
        assert_eq!(
            st.authenticate("unit-wordpress-0", "").unwrap_err(),
            KeelError::BadCredentials
        );
        assert!(unit.set_password("short").is_err());
        unit.set_password("a-long-password").unwrap();
        assert!(unit.password_valid("a-long-password"));

        let principal = st.authenticate("unit-wordpress-0", "a-long-password").unwrap();
        assert_eq!(principal.tag, Tag::Unit("wordpress/0".to_string()));
    }
}
