//! Container lifecycle for one engine run.
//!
//! [`ImageRunner::run`] pulls (optionally), creates, attaches, starts and
//! waits for the engine container, and removes it on every path once it has
//! been created. Removal goes through a shared [`ContainerHandle`] so the
//! deferred cleanup, the exit-on-error reaction and the interrupt handler
//! remove the container at most once between them.

use std::io::Read;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::context::RunContext;
use crate::error::DockerError;
use crate::execution::docker_client::{lookup_env, ContainerRuntime, ContainerSpec};
use crate::execution::interrupt::{self, InterruptGuard, InterruptState};
use crate::execution::options::RunConfiguration;
use crate::execution::output::{reaction, OutputProcessor, OutputSummary, OutputTrigger, Reaction};
use crate::utils::extract_url;

/// Time allowed for the output stream to drain after the container stopped.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A created container, shared by every path that may remove it.
#[derive(Clone)]
pub struct ContainerHandle {
    id: String,
    runtime: Arc<dyn ContainerRuntime>,
    removed: Arc<AtomicBool>,
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("id", &self.id)
            .field("removed", &self.is_removed())
            .finish()
    }
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            id: id.into(),
            runtime,
            removed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether removal has been requested by any path.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Force-removes the container. Only the first call reaches the runtime.
    pub async fn remove_forcefully(&self) -> Result<(), DockerError> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::debug!(id = %self.id, "Removing container");
        self.runtime.remove_container(&self.id).await
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// Container exit code, if the container reported one.
    pub exit_code: Option<i64>,
    /// The interrupt handler fired during the run.
    pub interrupted: bool,
    /// Output statistics, if output was attached and drained in time.
    pub output: Option<OutputSummary>,
}

/// Runs the engine image against a [`ContainerRuntime`].
pub struct ImageRunner {
    runtime: Arc<dyn ContainerRuntime>,
    context: RunContext,
    drain_timeout: Duration,
}

impl ImageRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, context: RunContext) -> Self {
        Self {
            runtime,
            context,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Reads the docker access key from the engine image's environment.
    ///
    /// # Errors
    ///
    /// Returns `DockerError::MissingAccessKey` if the image carries no
    /// non-empty key.
    pub async fn docker_access_key(&self, pull: bool) -> Result<String, DockerError> {
        let settings = &self.context.app.container;
        if pull {
            self.runtime.pull_image(&settings.image_url).await?;
        }

        let env = self.runtime.image_env(&settings.image_url).await?;
        lookup_env(&env, &settings.docker_access_key_env)
            .filter(|key| !key.is_empty())
            .map(String::from)
            .ok_or_else(|| DockerError::MissingAccessKey(settings.docker_access_key_env.clone()))
    }

    /// Executes one run.
    ///
    /// Failures before creation return without touching Docker further. Once
    /// the container exists it is removed before this returns, whatever the
    /// outcome. A non-zero container exit code is reported in the outcome,
    /// not as an error.
    pub async fn run(&self, config: RunConfiguration) -> Result<RunOutcome, DockerError> {
        let settings = &self.context.app.container;

        if config.pull_latest_image {
            self.runtime.pull_image(&settings.image_url).await?;
        }

        let spec = ContainerSpec::new(settings.image_url.clone())
            .with_entrypoint(config.entrypoint.clone())
            .with_cmd(config.args.clone())
            .with_env(config.env_strings())
            .with_mounts(config.volumes.resolve())
            .with_stdin(true)
            .with_tty(true);

        self.context
            .telemetry
            .record_atomic("dockerCmd", config.args.join(" "));

        let created = self.runtime.create_container(&spec).await?;
        if !created.warnings.is_empty() {
            println!("\n> Encountered warnings:");
            for (i, warning) in created.warnings.iter().enumerate() {
                println!("{} {}", i + 1, warning);
                self.context.telemetry.record_array("warning", warning);
            }
        }

        let container = ContainerHandle::new(created.id, self.runtime.clone());
        let result = self.drive(&container, &config).await;

        if let Err(e) = container.remove_forcefully().await {
            tracing::warn!(id = %container.id(), error = %e, "Failed to remove container");
        }

        result
    }

    async fn drive(
        &self,
        container: &ContainerHandle,
        config: &RunConfiguration,
    ) -> Result<RunOutcome, DockerError> {
        let failure = Arc::new(OnceLock::new());
        let triggers = self.output_triggers(container, config, &failure);

        let mut output_task = None;
        if config.needs_attach() {
            let streams = self.runtime.attach_container(container.id()).await?;

            let mut processor = OutputProcessor::new(triggers);
            if config.attach_output {
                processor = processor.with_stdout_echo();
            }
            output_task = Some(processor.spawn(streams.output));

            if config.forward_stdin {
                forward_stdin(self.context.input(), streams.input);
            }
        }

        println!("\n> Starting container with the latest image");
        println!("> Container ID: {}", container.id());
        self.runtime.start_container(container.id()).await?;

        let guard = if config.setup_interrupt {
            Some(self.install_interrupt(container)?)
        } else {
            None
        };

        println!("\n> Waiting for process to complete:");
        let waited = self.runtime.wait_container(container.id()).await;

        let interrupted = match guard {
            Some(guard) => guard.release().await == InterruptState::Fired,
            None => false,
        };

        let exit_code = match waited {
            Ok(code) => code,
            Err(e) if container.is_removed() => {
                tracing::debug!(error = %e, "Container removed while waiting");
                None
            }
            Err(e) => return Err(e),
        };

        let output = match output_task {
            Some(task) => {
                let abort = task.abort_handle();
                match tokio::time::timeout(self.drain_timeout, task).await {
                    Ok(Ok(summary)) => Some(summary),
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "Output processing failed");
                        None
                    }
                    Err(_) => {
                        tracing::debug!("Output stream did not close within the drain period");
                        abort.abort();
                        None
                    }
                }
            }
            None => None,
        };

        if let Some(line) = failure.get() {
            return Err(DockerError::ContainerReportedError(line.clone()));
        }

        if let Some(code) = exit_code.filter(|code| *code != 0) {
            tracing::warn!(exit_code = code, "Container exited with non-zero status");
        }

        Ok(RunOutcome {
            exit_code,
            interrupted,
            output,
        })
    }

    fn output_triggers(
        &self,
        container: &ContainerHandle,
        config: &RunConfiguration,
        failure: &Arc<OnceLock<String>>,
    ) -> Vec<OutputTrigger> {
        let mut triggers = Vec::new();

        if let Some(patterns) = &config.browser_triggers {
            triggers.push(OutputTrigger::new(patterns.clone(), self.browser_reaction()));
        }
        if let Some(patterns) = &config.exit_triggers {
            triggers.push(OutputTrigger::new(
                patterns.clone(),
                self.exit_reaction(container.clone(), failure.clone()),
            ));
        }
        triggers.extend(config.output_triggers.iter().cloned());

        triggers
    }

    fn browser_reaction(&self) -> Reaction {
        let context = self.context.clone();
        reaction(move |line| {
            let context = context.clone();
            async move {
                let telemetry = &context.telemetry;
                telemetry.record_atomic("didReceiveCloudLinkMessage", true);

                let Some(url) = extract_url(&line) else {
                    return;
                };
                telemetry.record_atomic("didParseCloudLink", true);

                let opened = context.open_url(url);
                if let Err(e) = &opened {
                    telemetry.record_array("error", e);
                }
                telemetry.record_atomic("didAutoSpawnBrowser", opened.is_ok());
            }
        })
    }

    fn exit_reaction(&self, container: ContainerHandle, failure: Arc<OnceLock<String>>) -> Reaction {
        let context = self.context.clone();
        reaction(move |line| {
            let container = container.clone();
            let failure = failure.clone();
            let context = context.clone();
            async move {
                if failure.set(line.clone()).is_err() {
                    return;
                }

                println!("\n> Some error occurred");
                if !line.is_empty() {
                    println!("Find more details below:\n {line} \x1b[0m");
                    context.telemetry.record_array("warning", &line);
                }
                println!(
                    "\n> If this is an unexpected output, please try again or open an issue here: {}",
                    context.app.repository_url
                );
                println!("> Terminating..");

                if let Err(e) = container.remove_forcefully().await {
                    tracing::warn!(error = %e, "Failed to remove container after error");
                }
            }
        })
    }

    fn install_interrupt(&self, container: &ContainerHandle) -> Result<InterruptGuard, DockerError> {
        let container = container.clone();
        let context = self.context.clone();

        let guard = interrupt::install(self.context.signal(), move || async move {
            println!("\n> Received interrupt signal");
            println!("> Terminating..");
            if let Err(e) = container.remove_forcefully().await {
                tracing::warn!(error = %e, "Failed to remove container on interrupt");
            }
            context.terminate(0);
        })?;

        Ok(guard)
    }
}

/// Runs `config` with a fresh [`ImageRunner`].
pub async fn run_image(
    runtime: Arc<dyn ContainerRuntime>,
    context: &RunContext,
    config: RunConfiguration,
) -> Result<RunOutcome, DockerError> {
    ImageRunner::new(runtime, context.clone()).run(config).await
}

/// Copies `source` (the terminal's stdin in real runs) into the container.
///
/// Blocking reads happen on a dedicated thread so they never hold up
/// runtime shutdown.
fn forward_stdin(mut source: Box<dyn Read + Send>, mut input: Pin<Box<dyn AsyncWrite + Send>>) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(16);

    let reader = std::thread::Builder::new()
        .name("privado-stdin".to_string())
        .spawn(move || {
            let mut buffer = [0u8; 1024];
            loop {
                match source.read(&mut buffer) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.blocking_send(buffer[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    if let Err(e) = reader {
        tracing::warn!(error = %e, "Could not forward stdin to the container");
        return;
    }

    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if input.write_all(&chunk).await.is_err() || input.flush().await.is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::docker_client::{AttachedStreams, CreatedContainer};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingRuntime {
        removals: AtomicUsize,
    }

    #[async_trait]
    impl ContainerRuntime for CountingRuntime {
        async fn pull_image(&self, _image: &str) -> Result<(), DockerError> {
            Ok(())
        }

        async fn image_env(&self, _image: &str) -> Result<Vec<String>, DockerError> {
            Ok(vec![
                "PATH=/usr/bin".to_string(),
                "PRIVADO_DOCKER_ACCESS_KEY=secret".to_string(),
            ])
        }

        async fn create_container(
            &self,
            _spec: &ContainerSpec,
        ) -> Result<CreatedContainer, DockerError> {
            Ok(CreatedContainer {
                id: "c1".to_string(),
                warnings: Vec::new(),
            })
        }

        async fn attach_container(&self, id: &str) -> Result<AttachedStreams, DockerError> {
            Err(DockerError::AttachFailed {
                id: id.to_string(),
                reason: "unsupported".to_string(),
            })
        }

        async fn start_container(&self, _id: &str) -> Result<(), DockerError> {
            Ok(())
        }

        async fn wait_container(&self, _id: &str) -> Result<Option<i64>, DockerError> {
            Ok(Some(3))
        }

        async fn remove_container(&self, _id: &str) -> Result<(), DockerError> {
            self.removals.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context() -> RunContext {
        RunContext::new(
            crate::config::AppConfig::for_home("/home/dev", "test"),
            crate::telemetry::Telemetry::new(),
        )
    }

    #[tokio::test]
    async fn test_handle_removes_once() {
        let runtime = Arc::new(CountingRuntime::default());
        let handle = ContainerHandle::new("c1", runtime.clone());
        let clone = handle.clone();

        handle.remove_forcefully().await.unwrap();
        clone.remove_forcefully().await.unwrap();

        assert!(handle.is_removed());
        assert_eq!(runtime.removals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_docker_access_key() {
        let runtime = Arc::new(CountingRuntime::default());
        let runner = ImageRunner::new(runtime, context());

        assert_eq!(runner.docker_access_key(false).await.unwrap(), "secret");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_an_error() {
        let runtime = Arc::new(CountingRuntime::default());
        let runner = ImageRunner::new(runtime.clone(), context());

        let outcome = runner.run(RunConfiguration::default()).await.unwrap();

        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.interrupted);
        assert!(outcome.output.is_none());
        assert_eq!(runtime.removals.load(Ordering::SeqCst), 1);
    }
}
