//! Requested networks.
//!
//! Services (and units) record the networks they asked for in a document
//! keyed by the entity's global key (`s#wordpress`, `u#wordpress/0`).

use super::collections::REQUESTED_NETWORKS;
use super::State;
use crate::core::error::KeelResult;
use crate::store::encode_fields;
use crate::txn::{Assertion, Operation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RequestedNetworksDoc {
    #[serde(default)]
    networks: Vec<String>,
}

/// Global key of a service.
pub fn service_global_key(name: &str) -> String {
    format!("s#{}", name)
}

/// Global key of a unit.
pub fn unit_global_key(name: &str) -> String {
    format!("u#{}", name)
}

/// Insert the requested-networks document for `key`.
pub(crate) fn create_requested_networks_op(
    st: &State,
    key: &str,
    networks: &[String],
) -> KeelResult<Operation> {
    let doc = RequestedNetworksDoc {
        networks: networks.to_vec(),
    };
    Ok(Operation::new(REQUESTED_NETWORKS, st.doc_id(key))
        .assert(Assertion::DocMissing)
        .insert(encode_fields(&doc)?))
}

/// Remove the requested-networks document for `key`.
pub(crate) fn remove_requested_networks_op(st: &State, key: &str) -> Operation {
    Operation::new(REQUESTED_NETWORKS, st.doc_id(key)).remove()
}

impl State {
    /// Networks requested for the entity with the given global key.
    ///
    /// Entities created before networks were recorded have no document;
    /// that reads as an empty list.
    pub fn read_requested_networks(&self, key: &str) -> KeelResult<Vec<String>> {
        match self.fetch(REQUESTED_NETWORKS, key)? {
            Some(doc) => Ok(doc.decode::<RequestedNetworksDoc>()?.networks),
            None => {
                tracing::info!(key, "no requested networks document, treating as empty");
                Ok(Vec::new())
            }
        }
    }
}
