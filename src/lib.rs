//! Keel - transactional environment state behind a TLS request server.
//!
//! Keel keeps the documents describing one environment (services, units,
//! meter statuses, metrics, storage) in a document store and changes them
//! only through assertion-guarded multi-document transactions. Clients reach
//! the state over a multiplexed TLS connection.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Clients (TLS, JSON frames)                │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          API Server                             │
//! │   lifecycle │ login limiter │ scope check │ facades │ watchers  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Environment State                        │
//! │   services │ units │ meter status │ metrics │ storage │ users   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Transaction Runner + Store                   │
//! │        assertions │ retry │ journal │ change publication        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Main runtime orchestration
//! - [`core::time`] - Clocks
//! - [`core::error`] - Error types and wire error codes
//!
//! ## Storage and transactions
//! - [`store`] - Document store trait, in-memory and journal backends
//! - [`txn`] - Operations, assertions and the retrying runner
//! - [`watch`] - Change fan-out
//!
//! ## Domain
//! - [`state`] - Environment-scoped entities
//!
//! ## Serving
//! - [`net`] - TCP listener and TLS configuration
//! - [`apiserver`] - Connection server and facades
//! - [`client`] - API client
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - A transaction's operations commit together or not at all
//! - Every document id in an environment collection carries the environment uuid
//! - Changes for one watch are delivered in commit order
//! - The server reports dead only after every connection has drained

// Core infrastructure
pub mod core;

// Storage and transactions
pub mod store;
pub mod txn;
pub mod watch;

// Domain model
pub mod state;

// Networking
pub mod apiserver;
pub mod client;
pub mod net;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime, time};
pub use apiserver::{Registry, Server, ServerOptions};
pub use client::Client;
pub use self::core::error::{KeelError, KeelResult};
pub use state::State;
