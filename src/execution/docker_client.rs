//! Docker API wrapper using the bollard crate.
//!
//! [`ContainerRuntime`] is the seam between the run lifecycle and the Docker
//! daemon; [`DockerClient`] is its bollard implementation.

use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount};
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio_util::io::StreamReader;

use crate::error::DockerError;
use crate::execution::volumes::VolumeMount;

/// Configuration for creating the engine container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Docker image to use.
    pub image: String,
    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,
    /// Command arguments.
    pub cmd: Vec<String>,
    /// Environment variables in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// Bind mounts.
    pub mounts: Vec<VolumeMount>,
    /// Attach and keep stdin open.
    pub stdin: bool,
    /// Allocate a pseudo-TTY.
    pub tty: bool,
}

impl ContainerSpec {
    /// Creates a specification for `image` with interactive defaults.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            entrypoint: None,
            cmd: Vec::new(),
            env: Vec::new(),
            mounts: Vec::new(),
            stdin: true,
            tty: true,
        }
    }

    pub fn with_entrypoint(mut self, entrypoint: Option<Vec<String>>) -> Self {
        self.entrypoint = entrypoint;
        self
    }

    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_mounts(mut self, mounts: Vec<VolumeMount>) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn with_stdin(mut self, stdin: bool) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn with_tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    fn to_bollard_config(&self) -> Config<String> {
        let host_config = HostConfig {
            mounts: if self.mounts.is_empty() {
                None
            } else {
                Some(self.mounts.iter().map(Mount::from).collect())
            },
            ..Default::default()
        };

        Config {
            image: Some(self.image.clone()),
            entrypoint: self.entrypoint.clone(),
            cmd: Some(self.cmd.clone()),
            env: if self.env.is_empty() {
                None
            } else {
                Some(self.env.clone())
            },
            attach_stdin: Some(self.stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(self.stdin),
            tty: Some(self.tty),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

/// A freshly created container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedContainer {
    pub id: String,
    pub warnings: Vec<String>,
}

/// Streams attached to a container.
pub struct AttachedStreams {
    /// Combined stdout/stderr.
    pub output: Pin<Box<dyn AsyncBufRead + Send>>,
    /// Container stdin.
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl std::fmt::Debug for AttachedStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedStreams").finish_non_exhaustive()
    }
}

/// Container operations used by a run.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pulls `image`, printing progress.
    async fn pull_image(&self, image: &str) -> Result<(), DockerError>;

    /// Environment baked into `image`, as `KEY=VALUE` strings.
    async fn image_env(&self, image: &str) -> Result<Vec<String>, DockerError>;

    async fn create_container(&self, spec: &ContainerSpec)
        -> Result<CreatedContainer, DockerError>;

    async fn attach_container(&self, id: &str) -> Result<AttachedStreams, DockerError>;

    async fn start_container(&self, id: &str) -> Result<(), DockerError>;

    /// Waits until the container is no longer running.
    ///
    /// Returns the exit code, or `None` if the container disappeared.
    async fn wait_container(&self, id: &str) -> Result<Option<i64>, DockerError>;

    /// Force-removes the container and its anonymous volumes.
    ///
    /// A container that is already gone, or already being removed, counts as
    /// removed.
    async fn remove_container(&self, id: &str) -> Result<(), DockerError>;
}

/// Docker client wrapper for container operations.
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Creates a new Docker client connecting to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `DockerError::DaemonUnavailable` if the Docker daemon is not accessible.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Checks that the daemon answers.
    pub async fn ping(&self) -> Result<(), DockerError> {
        self.docker
            .ping()
            .await
            .map_err(|e| DockerError::DaemonUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        let pull_failed = |reason: String| DockerError::PullFailed {
            image: image.to_string(),
            reason,
        };

        println!("\n> Pulling the latest image: {image}");

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| pull_failed(e.to_string()))?;
            if let Some(error) = info.error {
                return Err(pull_failed(error));
            }

            match (info.status, info.progress) {
                (Some(status), Some(progress)) => {
                    tracing::debug!(id = ?info.id, %status, %progress, "Pull progress");
                }
                (Some(status), None) => match info.id {
                    Some(id) => println!("{id}: {status}"),
                    None => println!("{status}"),
                },
                _ => {}
            }
        }

        Ok(())
    }

    async fn image_env(&self, image: &str) -> Result<Vec<String>, DockerError> {
        let inspect = self
            .docker
            .inspect_image(image)
            .await
            .map_err(|e| DockerError::InspectFailed {
                image: image.to_string(),
                reason: e.to_string(),
            })?;

        Ok(inspect
            .config
            .and_then(|config| config.env)
            .unwrap_or_default())
    }

    async fn create_container(
        &self,
        spec: &ContainerSpec,
    ) -> Result<CreatedContainer, DockerError> {
        let response = self
            .docker
            .create_container(
                None::<CreateContainerOptions<String>>,
                spec.to_bollard_config(),
            )
            .await
            .map_err(|e| DockerError::CreateFailed(e.to_string()))?;

        Ok(CreatedContainer {
            id: response.id,
            warnings: response.warnings,
        })
    }

    async fn attach_container(&self, id: &str) -> Result<AttachedStreams, DockerError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            detach_keys: None,
        };

        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(id, Some(options))
            .await
            .map_err(|e| DockerError::AttachFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        let bytes = output
            .map_ok(|chunk| chunk.into_bytes())
            .map_err(io::Error::other);

        Ok(AttachedStreams {
            output: Box::pin(StreamReader::new(bytes)),
            input,
        })
    }

    async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DockerError::StartFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn wait_container(&self, id: &str) -> Result<Option<i64>, DockerError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(Some(response.status_code)),
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(Some(code)),
            Some(Err(e)) if is_not_found_error(&e) => Ok(None),
            Some(Err(e)) => Err(DockerError::WaitFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(None),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found_error(&e) || is_conflict_error(&e) => {
                tracing::debug!(id, error = %e, "Container already removed");
                Ok(())
            }
            Err(e) => Err(DockerError::RemoveFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

fn is_not_found_error(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Docker answers 409 while a removal is already in progress.
fn is_conflict_error(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 409,
            ..
        }
    )
}

/// Value of `key` in a list of `KEY=VALUE` strings.
pub fn lookup_env<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    env.iter().find_map(|entry| {
        let (name, value) = entry.split_once('=')?;
        (name == key).then_some(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::MountTypeEnum;
    use std::path::PathBuf;

    #[test]
    fn test_container_spec_builder() {
        let spec = ContainerSpec::new("public.ecr.aws/privado/cli:latest")
            .with_entrypoint(Some(vec!["/bin/core".to_string(), "upload".to_string()]))
            .with_cmd(vec!["/app/code".to_string(), "-i".to_string()])
            .with_env(vec!["CI=FALSE".to_string()])
            .with_stdin(false);

        assert_eq!(spec.image, "public.ecr.aws/privado/cli:latest");
        assert_eq!(spec.entrypoint.as_ref().unwrap().len(), 2);
        assert_eq!(spec.cmd, vec!["/app/code", "-i"]);
        assert!(!spec.stdin);
        assert!(spec.tty);
    }

    #[test]
    fn test_bollard_config_mapping() {
        let spec = ContainerSpec::new("image:tag")
            .with_cmd(vec!["/app/code".to_string()])
            .with_mounts(vec![VolumeMount {
                host_path: PathBuf::from("/repo"),
                container_path: "/app/code".to_string(),
                read_only: false,
            }]);

        let config = spec.to_bollard_config();
        assert_eq!(config.image.as_deref(), Some("image:tag"));
        assert_eq!(config.attach_stdin, Some(true));
        assert_eq!(config.open_stdin, Some(true));
        assert_eq!(config.tty, Some(true));
        assert!(config.env.is_none());
        assert!(config.entrypoint.is_none());

        let mounts = config.host_config.unwrap().mounts.unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].typ, Some(MountTypeEnum::BIND));
        assert_eq!(mounts[0].source.as_deref(), Some("/repo"));
    }

    #[test]
    fn test_error_classification() {
        let not_found = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "removal in progress".to_string(),
        };
        let server = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };

        assert!(is_not_found_error(&not_found));
        assert!(!is_not_found_error(&conflict));
        assert!(is_conflict_error(&conflict));
        assert!(!is_not_found_error(&server));
        assert!(!is_conflict_error(&server));
    }

    #[test]
    fn test_lookup_env() {
        let env = vec![
            "PATH=/usr/bin".to_string(),
            "PRIVADO_DOCKER_ACCESS_KEY=abc=def".to_string(),
            "EMPTY=".to_string(),
        ];

        assert_eq!(lookup_env(&env, "PRIVADO_DOCKER_ACCESS_KEY"), Some("abc=def"));
        assert_eq!(lookup_env(&env, "EMPTY"), Some(""));
        assert_eq!(lookup_env(&env, "MISSING"), None);
    }
}
