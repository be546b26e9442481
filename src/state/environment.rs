//! Environment document.

use super::collections::ENVIRONMENTS;
use super::life::Life;
use super::user::new_user_ops;
use super::State;
use crate::core::error::{KeelError, KeelResult};
use crate::core::time::now_to_the_second;
use crate::store::encode_fields;
use crate::txn::{Assertion, Operation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EnvironmentDoc {
    uuid: String,
    name: String,
    life: Life,
    created: DateTime<Utc>,
}

/// The environment a [`State`] serves.
#[derive(Debug, Clone)]
pub struct Environment {
    doc: EnvironmentDoc,
}

impl Environment {
    pub fn uuid(&self) -> &str {
        &self.doc.uuid
    }

    pub fn name(&self) -> &str {
        &self.doc.name
    }

    pub fn life(&self) -> Life {
        self.doc.life
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.doc.created
    }
}

impl State {
    /// Create the environment document and its administrator.
    ///
    /// Fails with `AlreadyExists` if the environment was already created.
    pub fn initialize(&self, name: &str, admin_user: &str, admin_password: &str) -> KeelResult<()> {
        let doc = EnvironmentDoc {
            uuid: self.env_uuid().to_string(),
            name: name.to_string(),
            life: Life::Alive,
            created: now_to_the_second(self.clock()),
        };
        let mut ops = vec![Operation::new(ENVIRONMENTS, self.env_uuid())
            .assert(Assertion::DocMissing)
            .insert(encode_fields(&doc)?)];
        ops.extend(new_user_ops(self, admin_user, admin_user, admin_password, admin_user)?);

        match self.run_ops(ops) {
            Ok(()) => {
                tracing::info!(uuid = %self.env_uuid(), name, "environment initialized");
                Ok(())
            }
            Err(KeelError::TxnAborted) => Err(KeelError::already_exists(format!(
                "environment {}",
                self.env_uuid()
            ))),
            Err(e) => Err(e),
        }
    }

    /// Read the environment document.
    pub fn environment(&self) -> KeelResult<Environment> {
        let doc = self
            .store()
            .fetch(ENVIRONMENTS, self.env_uuid())?
            .ok_or_else(|| KeelError::not_found(format!("environment {:?}", self.env_uuid())))?;
        Ok(Environment { doc: doc.decode()? })
    }

    /// Assert the environment is alive.
    pub(crate) fn env_alive_op(&self) -> Operation {
        Operation::new(ENVIRONMENTS, self.env_uuid()).assert(super::life::is_alive())
    }
}
