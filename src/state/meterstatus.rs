//! Unit meter status.
//!
//! Every unit has a meter status document, created with the unit as
//! `NOT SET`. Only GREEN, AMBER and RED can be set by callers.

use super::collections::METER_STATUS;
use super::networks::unit_global_key;
use super::unit::Unit;
use super::State;
use crate::core::error::{KeelError, KeelResult};
use crate::store::encode_fields;
use crate::txn::{fields, Assertion, Operation, TxnPlan};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Meter status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeterStatusCode {
    #[serde(rename = "NOT SET")]
    NotSet,
    #[serde(rename = "NOT AVAILABLE")]
    NotAvailable,
    #[serde(rename = "GREEN")]
    Green,
    #[serde(rename = "AMBER")]
    Amber,
    #[serde(rename = "RED")]
    Red,
}

impl MeterStatusCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotSet => "NOT SET",
            Self::NotAvailable => "NOT AVAILABLE",
            Self::Green => "GREEN",
            Self::Amber => "AMBER",
            Self::Red => "RED",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "NOT SET" => Some(Self::NotSet),
            "NOT AVAILABLE" => Some(Self::NotAvailable),
            "GREEN" => Some(Self::Green),
            "AMBER" => Some(Self::Amber),
            "RED" => Some(Self::Red),
            _ => None,
        }
    }

    /// Parse a code callers may set.
    pub fn parse_settable(code: &str) -> KeelResult<Self> {
        match Self::parse(code) {
            Some(code @ (Self::Green | Self::Amber | Self::Red)) => Ok(code),
            _ => Err(KeelError::invalid(format!("invalid meter status {:?}", code))),
        }
    }
}

impl fmt::Display for MeterStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit's meter status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterStatus {
    pub code: MeterStatusCode,
    #[serde(default)]
    pub info: String,
}

impl MeterStatus {
    /// Reported when the status document cannot be read.
    pub fn not_available() -> Self {
        Self {
            code: MeterStatusCode::NotAvailable,
            info: String::new(),
        }
    }

    fn is(&self, code: MeterStatusCode, info: &str) -> bool {
        self.code == code && self.info == info
    }
}

/// Insert the `NOT SET` status document for a new unit.
pub(crate) fn create_meter_status_op(st: &State, unit: &str) -> KeelResult<Operation> {
    let doc = MeterStatus {
        code: MeterStatusCode::NotSet,
        info: String::new(),
    };
    Ok(Operation::new(METER_STATUS, st.doc_id(&unit_global_key(unit)))
        .assert(Assertion::DocMissing)
        .insert(encode_fields(&doc)?))
}

/// Remove a unit's status document.
pub(crate) fn remove_meter_status_op(st: &State, unit: &str) -> Operation {
    Operation::new(METER_STATUS, st.doc_id(&unit_global_key(unit))).remove()
}

/// Set a unit's status, asserting the unit is alive.
fn set_meter_status_ops(unit: &Unit, code: MeterStatusCode, info: &str) -> Vec<Operation> {
    vec![
        unit.alive_op(),
        Operation::new(METER_STATUS, unit.st.doc_id(&unit_global_key(unit.name())))
            .assert(Assertion::DocExists)
            .set(fields([("code", code.as_str()), ("info", info)])),
    ]
}

impl Unit {
    /// Set the meter status.
    pub fn set_meter_status(&mut self, code: &str, info: &str) -> KeelResult<()> {
        let code = MeterStatusCode::parse_settable(code)?;
        let current = self.meter_status_doc().map_err(|e| {
            e.annotate(format!("cannot update meter status for unit {}", self.name()))
        })?;
        if current.is(code, info) {
            return Ok(());
        }

        let st = self.st.clone();
        st.run(|attempt| {
            if attempt > 0 {
                self.refresh()?;
                let current = self.meter_status_doc().map_err(|e| {
                    e.annotate(format!("cannot update meter status for unit {}", self.name()))
                })?;
                if current.is(code, info) {
                    return Ok(TxnPlan::NoChange);
                }
            }
            Ok(TxnPlan::Apply(set_meter_status_ops(self, code, info)))
        })
        .map_err(|e| e.annotate(format!("cannot set meter state for unit {}", self.name())))
    }

    /// Read the meter status.
    ///
    /// Callers that need a value regardless can fall back to
    /// [`MeterStatus::not_available`] on error.
    pub fn get_meter_status(&self) -> KeelResult<MeterStatus> {
        self.meter_status_doc().map_err(|e| {
            e.annotate(format!("cannot retrieve meter status for unit {}", self.name()))
        })
    }

    fn meter_status_doc(&self) -> KeelResult<MeterStatus> {
        let doc = self
            .st
            .fetch(METER_STATUS, &unit_global_key(self.name()))?
            .ok_or_else(|| KeelError::not_found(format!("meter status for unit {}", self.name())))?;
        doc.decode()
    }
}

impl State {
    /// Set the same meter status on every unit in one transaction.
    ///
    /// The operation list is submitted once; any unit changing underneath
    /// fails the whole update with `TxnAborted`.
    pub fn set_meter_status_on_all_units(&self, code: &str, info: &str) -> KeelResult<()> {
        let code = MeterStatusCode::parse_settable(code)?;
        let mut ops = Vec::new();
        for service in self.all_services()? {
            for unit in service.all_units()? {
                ops.extend(set_meter_status_ops(&unit, code, info));
            }
        }
        self.run_ops(ops)
            .map_err(|e| e.annotate("cannot set meter state for all units"))
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
        let mut svc = st.add_service("metered", "cs:metered-1", &[]).unwrap();
        let unit = svc.add_unit().unwrap();
        (st, unit)
    }

    #[test]
    fn test_default_status_not_set() {
        let (_st, unit) = state_with_unit();
        let status = unit.get_meter_status().unwrap();
        assert_eq!(status.code, MeterStatusCode::NotSet);
        assert_eq!(status.info, "");
    }

    #[test]
    fn test_set_meter_status() {
        let (st, mut unit) = state_with_unit();
        unit.set_meter_status("GREEN", "all good").unwrap();
        assert_eq!(
            unit.get_meter_status().unwrap(),
            MeterStatus {
                code: MeterStatusCode::Green,
                info: "all good".to_string()
            }
        );

        // Setting the same value again is a no-op without a commit.
        let revision = st.store().revision();
        unit.set_meter_status("GREEN", "all good").unwrap();
        assert_eq!(st.store().revision(), revision);
    }

    #[test]
    fn test_invalid_codes_rejected() {
        let (_st, mut unit) = state_with_unit();
        for code in ["NOT SET", "NOT AVAILABLE", "PURPLE", ""] {
            let err = unit.set_meter_status(code, "").unwrap_err();
            assert!(matches!(err, KeelError::InvalidRequest { .. }), "{:?}", code);
        }
    }

    #[test]
    fn test_dead_unit_rejected() {
        let (_st, mut unit) = state_with_unit();
        let mut other = unit.clone();
        other.ensure_dead().unwrap();
        let err = unit.set_meter_status("RED", "").unwrap_err();
        assert!(err.is_conflict() || err.is_not_found(), "{:?}", err);
    }

    #[test]
    fn test_set_on_all_units() {
        let (st, _unit) = state_with_unit();
        st.service("metered").unwrap().add_unit().unwrap();
        st.set_meter_status_on_all_units("AMBER", "quota").unwrap();
        for unit in st.all_units().unwrap() {
            assert_eq!(unit.get_meter_status().unwrap().code, MeterStatusCode::Amber);
        }
        assert!(st.set_meter_status_on_all_units("NOT SET", "").is_err());
    }

    #[test]
    fn test_status_missing_falls_back() {
        let (st, unit) = state_with_unit();
        st.run_ops(vec![remove_meter_status_op(&st, unit.name())]).unwrap();
        let err = unit.get_meter_status().unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(MeterStatus::not_available().code, MeterStatusCode::NotAvailable);
    }
}
