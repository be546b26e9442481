//! Transaction engine.
//!
//! - [`op`] - operations, assertions and mutations
//! - [`runner`] - retrying runner with attempt-aware builders

pub mod op;
pub mod runner;

pub use op::{fields, Assertion, Mutation, Operation, Predicate};
pub use runner::{TxnPlan, TxnRunner, TxnStatsSnapshot, DEFAULT_MAX_ATTEMPTS};
