//! Entity lifecycle.

use crate::txn::op::{Assertion, Predicate};
use serde::{Deserialize, Serialize};

/// Lifecycle of an entity document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    Alive,
    Dying,
    Dead,
}

impl Life {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::Dying => "dying",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for Life {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The document exists and is alive.
pub fn is_alive() -> Assertion {
    Assertion::Matches(Predicate::eq("life", Life::Alive.as_str()))
}

/// The document exists and is not dead.
pub fn not_dead() -> Assertion {
    Assertion::Matches(Predicate::ne("life", Life::Dead.as_str()))
}

/// The document exists and is dead.
pub fn is_dead() -> Assertion {
    Assertion::Matches(Predicate::eq("life", Life::Dead.as_str()))
}
