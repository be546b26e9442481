//! CLI command implementations.

mod config;
mod ping;
mod start;

pub use config::{run_config, ConfigArgs};
pub use ping::{run_ping, PingArgs};
pub use start::{init_tracing, run_start, StartArgs};
