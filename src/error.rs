//! Error types for privado-cli operations.
//!
//! Defines error types for the major subsystems:
//! - Docker container lifecycle (pull, create, attach, start, wait, remove)
//! - Application and user configuration
//! - Telemetry reporting
//! - Interrupt handler installation

use thiserror::Error;

/// Errors that can occur during Docker operations.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to pull image '{image}': {reason}")]
    PullFailed { image: String, reason: String },

    #[error("Failed to inspect image '{image}': {reason}")]
    InspectFailed { image: String, reason: String },

    #[error("Failed to create container: {0}")]
    CreateFailed(String),

    #[error("Failed to attach to container '{id}': {reason}")]
    AttachFailed { id: String, reason: String },

    #[error("Failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    #[error("Error waiting for container '{id}': {reason}")]
    WaitFailed { id: String, reason: String },

    #[error("Failed to remove container '{id}': {reason}")]
    RemoveFailed { id: String, reason: String },

    #[error("Container reported an error: {0}")]
    ContainerReportedError(String),

    #[error("Docker access key '{0}' not found in image environment")]
    MissingAccessKey(String),

    #[error("Interrupt handler error: {0}")]
    Interrupt(#[from] InterruptError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine the home directory")]
    HomeDirectoryUnavailable,

    #[error("Could not resolve cache directory for package manager '{manager}': {reason}")]
    PackageCacheUnavailable { manager: String, reason: String },

    #[error("Cannot load user configuration ({path}): {reason}")]
    InvalidUserConfig { path: String, reason: String },

    #[error("Invalid user key at '{path}': {reason}")]
    InvalidUserKey { path: String, reason: String },

    #[error("Refusing to hash an empty key")]
    EmptyKey,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while posting telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Received non-ok status from telemetry: {0}")]
    UnexpectedStatus(u16),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the interrupt coordinator.
#[derive(Debug, Error)]
pub enum InterruptError {
    #[error("An interrupt handler is already installed for another run")]
    AlreadyInstalled,
}
