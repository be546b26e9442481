//! Core runtime infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Startup, signal handling and shutdown
//! - [`time`] - Clocks
//! - [`error`] - Error types and wire error codes

pub mod config;
pub mod error;
pub mod runtime;
pub mod time;
