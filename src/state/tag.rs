//! Entity tags.
//!
//! Tags name entities on the wire: `user-admin`, `unit-wordpress-0`,
//! `service-wordpress`, `storage-data-0`. Unit and storage names carry a
//! `/` that is written as the last `-` in the tag.

use crate::core::error::{KeelError, KeelResult};
use std::fmt;

/// A parsed entity tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tag {
    User(String),
    Unit(String),
    Service(String),
    Storage(String),
}

impl Tag {
    /// Parse a tag string.
    pub fn parse(tag: &str) -> KeelResult<Self> {
        let invalid = || KeelError::invalid(format!("{:?} is not a valid tag", tag));
        let (kind, id) = tag.split_once('-').ok_or_else(invalid)?;
        if id.is_empty() {
            return Err(invalid());
        }
        match kind {
            "user" => Ok(Self::User(id.to_string())),
            "service" => Ok(Self::Service(id.to_string())),
            "unit" => slashed(id).map(Self::Unit).ok_or_else(invalid),
            "storage" => slashed(id).map(Self::Storage).ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Unit(_) => "unit",
            Self::Service(_) => "service",
            Self::Storage(_) => "storage",
        }
    }

    /// Entity name (`wordpress/0` for a unit tag).
    pub fn id(&self) -> &str {
        match self {
            Self::User(id) | Self::Unit(id) | Self::Service(id) | Self::Storage(id) => id,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind(), self.id().replace('/', "-"))
    }
}

/// `wordpress-0` -> `wordpress/0`.
fn slashed(id: &str) -> Option<String> {
    let (name, seq) = id.rsplit_once('-')?;
    if name.is_empty() || seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(format!("{}/{}", name, seq))
}
