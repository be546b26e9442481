//! Users, credentials and authentication.
//!
//! Passwords are never stored; documents carry a random salt and the hex
//! SHA-256 of `salt || password`.

use super::collections::{UNITS, USERS};
use super::tag::Tag;
use super::State;
use crate::core::error::{KeelError, KeelResult};
use crate::core::time::now_to_the_second;
use crate::store::encode_fields;
use crate::txn::{fields, Assertion, Operation, TxnPlan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Salted password hash.
pub fn password_hash(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fresh random salt.
pub fn new_salt() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Check a password against a stored hash. An empty hash never matches.
pub(crate) fn password_matches(password: &str, salt: &str, hash: &str) -> bool {
    !hash.is_empty() && password_hash(password, salt) == hash
}

/// Whether `name` is acceptable as a user name.
pub fn is_valid_user_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '+')
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserDoc {
    name: String,
    display_name: String,
    password_hash: String,
    password_salt: String,
    #[serde(default)]
    deactivated: bool,
    created_by: String,
    date_created: DateTime<Utc>,
}

/// Operations inserting a new user.
pub(crate) fn new_user_ops(
    st: &State,
    name: &str,
    display_name: &str,
    password: &str,
    creator: &str,
) -> KeelResult<Vec<Operation>> {
    if !is_valid_user_name(name) {
        return Err(KeelError::invalid(format!("invalid user name {:?}", name)));
    }
    let salt = new_salt();
    let doc = UserDoc {
        name: name.to_string(),
        display_name: display_name.to_string(),
        password_hash: password_hash(password, &salt),
        password_salt: salt,
        deactivated: false,
        created_by: creator.to_string(),
        date_created: now_to_the_second(st.clock()),
    };
    Ok(vec![Operation::new(USERS, st.doc_id(name))
        .assert(Assertion::DocMissing)
        .insert(encode_fields(&doc)?)])
}

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub tag: Tag,
}

impl Principal {
    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub fn is_user(&self) -> bool {
        matches!(self.tag, Tag::User(_))
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.tag.fmt(f)
    }
}

/// A user of the environment.
#[derive(Debug, Clone)]
pub struct User {
    st: State,
    doc: UserDoc,
}

impl User {
    pub fn name(&self) -> &str {
        &self.doc.name
    }

    pub fn display_name(&self) -> &str {
        &self.doc.display_name
    }

    pub fn created_by(&self) -> &str {
        &self.doc.created_by
    }

    pub fn date_created(&self) -> DateTime<Utc> {
        self.doc.date_created
    }

    pub fn is_deactivated(&self) -> bool {
        self.doc.deactivated
    }

    pub fn tag(&self) -> Tag {
        Tag::User(self.doc.name.clone())
    }

    pub fn password_valid(&self, password: &str) -> bool {
        password_matches(password, &self.doc.password_salt, &self.doc.password_hash)
    }

    pub fn refresh(&mut self) -> KeelResult<()> {
        *self = self.st.user(&self.doc.name)?;
        Ok(())
    }

    /// Replace the password.
    pub fn set_password(&mut self, password: &str) -> KeelResult<()> {
        let salt = new_salt();
        let hash = password_hash(password, &salt);
        let id = self.st.doc_id(&self.doc.name);
        self.st.run_ops(vec![Operation::new(USERS, id)
            .assert(Assertion::DocExists)
            .set(fields([
                ("password_hash", hash.clone()),
                ("password_salt", salt.clone()),
            ]))])
            .map_err(|e| match e {
                KeelError::TxnAborted => KeelError::not_found(format!("user {:?}", self.doc.name)),
                other => other.annotate(format!("cannot set password of user {:?}", self.doc.name)),
            })?;
        self.doc.password_hash = hash;
        self.doc.password_salt = salt;
        Ok(())
    }

    /// Stop the user from logging in.
    pub fn deactivate(&mut self) -> KeelResult<()> {
        self.set_deactivated(true)
    }

    pub fn activate(&mut self) -> KeelResult<()> {
        self.set_deactivated(false)
    }

    fn set_deactivated(&mut self, value: bool) -> KeelResult<()> {
        let id = self.st.doc_id(&self.doc.name);
        self.st.run_ops(vec![Operation::new(USERS, id)
            .assert(Assertion::DocExists)
            .set(fields([("deactivated", value)]))])
            .map_err(|e| match e {
                KeelError::TxnAborted => KeelError::not_found(format!("user {:?}", self.doc.name)),
                other => other,
            })?;
        self.doc.deactivated = value;
        Ok(())
    }
}

impl State {
    /// Add a user.
    pub fn add_user(
        &self,
        name: &str,
        display_name: &str,
        password: &str,
        creator: &str,
    ) -> KeelResult<User> {
        self.run(|attempt| {
            if attempt > 0 && self.fetch(USERS, name)?.is_some() {
                return Err(KeelError::already_exists(format!("user {:?}", name)));
            }
            Ok(TxnPlan::Apply(new_user_ops(
                self,
                name,
                display_name,
                password,
                creator,
            )?))
        })
        .map_err(|e| e.annotate(format!("cannot add user {:?}", name)))?;
        self.user(name)
    }

    /// Look up a user.
    pub fn user(&self, name: &str) -> KeelResult<User> {
        let doc = self
            .fetch(USERS, name)?
            .ok_or_else(|| KeelError::not_found(format!("user {:?}", name)))?;
        Ok(User {
            st: self.clone(),
            doc: doc.decode()?,
        })
    }

    /// Verify credentials for a user or unit tag.
    ///
    /// Unknown entities, wrong passwords and deactivated users all fail
    /// with `BadCredentials`.
    pub fn authenticate(&self, tag: &str, password: &str) -> KeelResult<Principal> {
        let tag = Tag::parse(tag)?;
        let ok = match &tag {
            Tag::User(name) => match self.fetch(USERS, name)? {
                Some(doc) => {
                    let user: UserDoc = doc.decode()?;
                    !user.deactivated
                        && password_matches(password, &user.password_salt, &user.password_hash)
                }
                None => false,
            },
            Tag::Unit(name) => match self.fetch(UNITS, name)? {
                Some(doc) => {
                    let salt = doc.get("password_salt").and_then(|v| v.as_str()).unwrap_or("");
                    let hash = doc.get("password_hash").and_then(|v| v.as_str()).unwrap_or("");
                    password_matches(password, salt, hash)
                }
                None => false,
            },
            Tag::Service(_) | Tag::Storage(_) => false,
        };
        if !ok {
            tracing::debug!(tag = %tag, "authentication failed");
            return Err(KeelError::BadCredentials);
        }
        Ok(Principal { tag })
    }
}
