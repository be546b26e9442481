//! Services.

use super::collections::{SERVICES, UNITS};
use super::life::{self, Life};
use super::meterstatus::create_meter_status_op;
use super::networks::{create_requested_networks_op, remove_requested_networks_op, service_global_key};
use super::tag::Tag;
use super::unit::{Unit, UnitDoc};
use super::State;
use crate::core::error::{KeelError, KeelResult};
use crate::store::{encode_fields, Document};
use crate::txn::{fields, Assertion, Operation, Predicate, TxnPlan};
use serde::{Deserialize, Serialize};

/// Whether `name` is acceptable as a service name.
pub fn is_valid_service_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    !name.ends_with('-')
        && !name.contains("--")
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name
            .rsplit('-')
            .next()
            .is_some_and(|last| last.bytes().all(|b| b.is_ascii_digit()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ServiceDoc {
    pub name: String,
    pub charm_url: String,
    pub life: Life,
    /// Next unit number.
    pub unit_seq: u64,
    /// Units not yet removed.
    pub unit_count: u64,
}

/// A deployed service.
#[derive(Debug, Clone)]
pub struct Service {
    st: State,
    doc: ServiceDoc,
    version: u64,
}

impl Service {
    fn from_doc(st: &State, doc: Document) -> KeelResult<Self> {
        Ok(Self {
            st: st.clone(),
            version: doc.version,
            doc: doc.decode()?,
        })
    }

    pub fn name(&self) -> &str {
        &self.doc.name
    }

    pub fn charm_url(&self) -> &str {
        &self.doc.charm_url
    }

    pub fn life(&self) -> Life {
        self.doc.life
    }

    pub fn unit_count(&self) -> u64 {
        self.doc.unit_count
    }

    pub fn tag(&self) -> Tag {
        Tag::Service(self.doc.name.clone())
    }

    pub fn refresh(&mut self) -> KeelResult<()> {
        *self = self.st.service(&self.doc.name)?;
        Ok(())
    }

    /// Networks this service asked for.
    pub fn networks(&self) -> KeelResult<Vec<String>> {
        self.st
            .read_requested_networks(&service_global_key(&self.doc.name))
    }

    /// Add a unit, numbered from the service's sequence.
    pub fn add_unit(&mut self) -> KeelResult<Unit> {
        let mut name = String::new();
        let st = self.st.clone();
        st.run(|attempt| {
            if attempt > 0 {
                self.refresh()?;
            }
            if self.doc.life != Life::Alive {
                return Err(KeelError::invalid("service is not alive"));
            }
            name = format!("{}/{}", self.doc.name, self.doc.unit_seq);
            let unit = UnitDoc::new(&name, &self.doc.name, &self.doc.charm_url);
            Ok(TxnPlan::Apply(vec![
                Operation::new(SERVICES, st.doc_id(&self.doc.name))
                    .assert(Assertion::Matches(Predicate::and(vec![
                        Predicate::eq("life", Life::Alive.as_str()),
                        Predicate::Version(self.version),
                    ])))
                    .set(fields([
                        ("unit_seq", self.doc.unit_seq + 1),
                        ("unit_count", self.doc.unit_count + 1),
                    ])),
                Operation::new(UNITS, st.doc_id(&name))
                    .assert(Assertion::DocMissing)
                    .insert(encode_fields(&unit)?),
                create_meter_status_op(&st, &name)?,
            ]))
        })
        .map_err(|e| e.annotate(format!("cannot add unit to service {:?}", self.doc.name)))?;

        tracing::debug!(unit = %name, "unit added");
        self.refresh()?;
        st.unit(&name)
    }

    /// Units of this service.
    pub fn all_units(&self) -> KeelResult<Vec<Unit>> {
        let prefix = format!("{}/", self.doc.name);
        self.st
            .scan(UNITS, &prefix)?
            .into_iter()
            .map(|doc| Unit::from_doc(&self.st, doc))
            .collect()
    }

    /// Remove the service if it has no units, otherwise mark it dying.
    pub fn destroy(&mut self) -> KeelResult<()> {
        let st = self.st.clone();
        st.run(|attempt| {
            if attempt > 0 {
                match self.refresh() {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => return Ok(TxnPlan::NoChange),
                    Err(e) => return Err(e),
                }
            }
            let id = st.doc_id(&self.doc.name);
            let assert_unchanged = Assertion::Matches(Predicate::Version(self.version));
            if self.doc.unit_count == 0 {
                Ok(TxnPlan::Apply(vec![
                    Operation::new(SERVICES, id).assert(assert_unchanged).remove(),
                    remove_requested_networks_op(&st, &service_global_key(&self.doc.name)),
                ]))
            } else if self.doc.life == Life::Alive {
                Ok(TxnPlan::Apply(vec![Operation::new(SERVICES, id)
                    .assert(assert_unchanged)
                    .set(fields([("life", Life::Dying.as_str())]))]))
            } else {
                Ok(TxnPlan::NoChange)
            }
        })
        .map_err(|e| e.annotate(format!("cannot destroy service {:?}", self.doc.name)))?;

        match self.refresh() {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                self.doc.life = Life::Dead;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl State {
    /// Deploy a new service.
    pub fn add_service(
        &self,
        name: &str,
        charm_url: &str,
        networks: &[String],
    ) -> KeelResult<Service> {
        if !is_valid_service_name(name) {
            return Err(KeelError::invalid(format!("invalid service name {:?}", name)));
        }
        let doc = ServiceDoc {
            name: name.to_string(),
            charm_url: charm_url.to_string(),
            life: Life::Alive,
            unit_seq: 0,
            unit_count: 0,
        };
        self.run(|attempt| {
            if attempt > 0 {
                if self.environment()?.life() != Life::Alive {
                    return Err(KeelError::invalid("environment is no longer alive"));
                }
                if self.fetch(SERVICES, name)?.is_some() {
                    return Err(KeelError::already_exists(format!("service {:?}", name)));
                }
            }
            Ok(TxnPlan::Apply(vec![
                self.env_alive_op(),
                Operation::new(SERVICES, self.doc_id(name))
                    .assert(Assertion::DocMissing)
                    .insert(encode_fields(&doc)?),
                create_requested_networks_op(self, &service_global_key(name), networks)?,
            ]))
        })
        .map_err(|e| e.annotate(format!("cannot add service {:?}", name)))?;

        tracing::debug!(service = name, charm = charm_url, "service added");
        self.service(name)
    }

    /// Look up a service.
    pub fn service(&self, name: &str) -> KeelResult<Service> {
        let doc = self
            .fetch(SERVICES, name)?
            .ok_or_else(|| KeelError::not_found(format!("service {:?}", name)))?;
        Service::from_doc(self, doc)
    }

    /// Every service in the environment.
    pub fn all_services(&self) -> KeelResult<Vec<Service>> {
        self.scan(SERVICES, "")?
            .into_iter()
            .map(|doc| Service::from_doc(self, doc))
            .collect()
    }

    /// Assert the named service exists and is alive.
    pub(crate) fn service_alive_op(&self, name: &str) -> Operation {
        Operation::new(SERVICES, self.doc_id(name)).assert(life::is_alive())
    }
}
