//! Docker execution layer for the Privado engine.
//!
//! This module builds and drives the engine container using the bollard
//! crate: mount resolution, option building, the container lifecycle, output
//! processing and interrupt coordination.
//!
//! # Architecture
//!
//! A run follows this lifecycle:
//! ```text
//! PULL? → CREATE → ATTACH? → START → INTERRUPT? → WAIT → DRAIN → REMOVE
//! ```
//!
//! # Example
//!
//! ```ignore
//! use privado_cli::execution::{DockerClient, ImageRunner, RunOptions};
//!
//! let client = Arc::new(DockerClient::new()?);
//! let config = RunOptions::new(&context)
//!     .with_args(vec![context.app.container.source_code_path.clone()])
//!     .with_source_volume("/repo")
//!     .with_attached_output()
//!     .with_interrupt()
//!     .build();
//!
//! let outcome = ImageRunner::new(client, context.clone()).run(config).await?;
//! ```

pub mod container;
pub mod docker_client;
pub mod interrupt;
pub mod options;
pub mod output;
pub mod volumes;

pub use container::{run_image, ContainerHandle, ImageRunner, RunOutcome, DEFAULT_DRAIN_TIMEOUT};
pub use docker_client::{
    AttachedStreams, ContainerRuntime, ContainerSpec, CreatedContainer, DockerClient,
};
pub use interrupt::{InterruptGuard, InterruptState};
pub use options::{EngineFlag, EnvVar, RunConfiguration, RunOptions};
pub use output::{reaction, OutputProcessor, OutputSummary, OutputTrigger, Reaction};
pub use volumes::{MountSlot, VolumeMount, VolumeSet};
