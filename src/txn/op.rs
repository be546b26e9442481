//! Transaction operations.
//!
//! An [`Operation`] names one document and carries an [`Assertion`] checked
//! against the state before the transaction, plus a [`Mutation`] staged if
//! every assertion in the transaction holds.

use crate::store::{Document, Fields};
use serde_json::Value;

/// Precondition on one document.
#[derive(Debug, Clone, PartialEq)]
pub enum Assertion {
    /// Unconditional.
    None,
    /// The document must exist.
    DocExists,
    /// The document must not exist.
    DocMissing,
    /// The document must exist and satisfy the predicate.
    Matches(Predicate),
}

impl Assertion {
    /// Evaluate against the current document, if any.
    pub fn holds(&self, doc: Option<&Document>) -> bool {
        match (self, doc) {
            (Self::None, _) => true,
            (Self::DocExists, found) => found.is_some(),
            (Self::DocMissing, found) => found.is_none(),
            (Self::Matches(predicate), Some(doc)) => predicate.evaluate(doc),
            (Self::Matches(_), None) => false,
        }
    }
}

/// Field and version predicates.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Field equals value.
    Eq(String, Value),
    /// Field is absent or differs from value.
    Ne(String, Value),
    /// Document version equals.
    Version(u64),
    /// All predicates hold.
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(field.into(), value.into())
    }

    pub fn and(predicates: Vec<Predicate>) -> Self {
        Self::And(predicates)
    }

    /// Evaluate against an existing document.
    pub fn evaluate(&self, doc: &Document) -> bool {
        match self {
            Self::Eq(field, value) => doc.get(field) == Some(value),
            Self::Ne(field, value) => doc.get(field) != Some(value),
            Self::Version(version) => doc.version == *version,
            Self::And(predicates) => predicates.iter().all(|p| p.evaluate(doc)),
        }
    }
}

/// Change applied to one document.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Assert only.
    None,
    /// Create the document; aborts if it exists.
    Insert(Fields),
    /// Merge fields into the document; aborts if it is missing.
    Set(Fields),
    /// Drop fields from the document; aborts if it is missing.
    Unset(Vec<String>),
    /// Delete the document; no-op if it is missing.
    Remove,
}

/// One document operation within a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub collection: String,
    pub id: String,
    pub assertion: Assertion,
    pub mutation: Mutation,
}

impl Operation {
    /// Unconditional no-op on the named document.
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            assertion: Assertion::None,
            mutation: Mutation::None,
        }
    }

    pub fn assert(mut self, assertion: Assertion) -> Self {
        self.assertion = assertion;
        self
    }

    pub fn insert(mut self, fields: Fields) -> Self {
        self.mutation = Mutation::Insert(fields);
        self
    }

    pub fn set(mut self, fields: Fields) -> Self {
        self.mutation = Mutation::Set(fields);
        self
    }

    pub fn unset(mut self, names: Vec<String>) -> Self {
        self.mutation = Mutation::Unset(names);
        self
    }

    pub fn remove(mut self) -> Self {
        self.mutation = Mutation::Remove;
        self
    }

    /// Whether this operation writes.
    pub fn is_write(&self) -> bool {
        !matches!(self.mutation, Mutation::None)
    }
}

/// Build a field map from `(name, value)` pairs.
pub fn fields<I, K, V>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
