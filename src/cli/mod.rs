//! Command-line interface for privado.
//!
//! Provides the engine-backed commands (scan, upload, validate) and the
//! local ones (version, update, config).

mod commands;
pub mod self_update;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
