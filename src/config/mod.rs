//! Configuration for the privado launcher.
//!
//! - [`AppConfig`]: process-wide paths, endpoints and container settings
//! - [`UserConfigFile`]: the user's persisted preferences
//! - [`UserSession`]: identity resolved for a single invocation

pub mod app;
pub mod user;

pub use app::{platform_name, AppConfig, ContainerSettings, PackageManager, RESULTS_URL_MARKER};
pub use user::{UserConfigFile, UserSession};
