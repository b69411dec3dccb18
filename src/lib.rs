//! privado-cli: launcher for the containerized Privado scan engine.
//!
//! This library resolves user identity and configuration, runs the engine
//! image with the target repository mounted, streams its output back to the
//! terminal and reacts to markers in that output (opening the results URL,
//! tearing the container down on errors).

pub mod auth;
pub mod ci;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod telemetry;
pub mod utils;

pub use context::RunContext;
pub use error::{ConfigError, DockerError, InterruptError, TelemetryError};

/// Version of the running CLI, injected at build time through `PRIVADO_CLI_VERSION`.
///
/// Local builds report `dev`, which disables update checks and self-update.
pub const VERSION: &str = match option_env!("PRIVADO_CLI_VERSION") {
    Some(version) => version,
    None => "dev",
};
