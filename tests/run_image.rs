//! Integration tests for the container run lifecycle.
//!
//! A scripted in-memory runtime stands in for the Docker daemon so the
//! lifecycle, output triggers and interrupt handling can be exercised without
//! Docker.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serial_test::serial;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::watch;

use privado_cli::config::AppConfig;
use privado_cli::execution::{
    AttachedStreams, ContainerRuntime, ContainerSpec, CreatedContainer, ImageRunner, RunOptions,
};
use privado_cli::telemetry::{MetricValue, Telemetry};
use privado_cli::{DockerError, RunContext};

const RESULTS_LINE: &str = "> Continue to view results on: https://app.privado.ai/r/abc123";

#[derive(Default)]
struct Script {
    fail_pull: bool,
    fail_create: bool,
    fail_start: bool,
    fail_wait: bool,
    /// Keep running after the output until removed.
    hang: bool,
    lines: Vec<String>,
    exit_code: i64,
}

struct MockRuntime {
    script: Script,
    calls: Mutex<Vec<String>>,
    specs: Mutex<Vec<ContainerSpec>>,
    removals: AtomicUsize,
    writer: Arc<tokio::sync::Mutex<Option<DuplexStream>>>,
    stdin: Arc<Mutex<Vec<u8>>>,
    stopped: watch::Sender<bool>,
    removed: watch::Sender<bool>,
}

impl MockRuntime {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
            removals: AtomicUsize::new(0),
            writer: Arc::new(tokio::sync::Mutex::new(None)),
            stdin: Arc::new(Mutex::new(Vec::new())),
            stopped: watch::channel(false).0,
            removed: watch::channel(false).0,
        })
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        self.record("pull");
        if self.script.fail_pull {
            return Err(DockerError::PullFailed {
                image: image.to_string(),
                reason: "manifest unknown".to_string(),
            });
        }
        Ok(())
    }

    async fn image_env(&self, _image: &str) -> Result<Vec<String>, DockerError> {
        self.record("inspect");
        Ok(vec!["PRIVADO_DOCKER_ACCESS_KEY=access".to_string()])
    }

    async fn create_container(
        &self,
        spec: &ContainerSpec,
    ) -> Result<CreatedContainer, DockerError> {
        self.record("create");
        if self.script.fail_create {
            return Err(DockerError::CreateFailed("no space left".to_string()));
        }
        self.specs.lock().unwrap().push(spec.clone());
        Ok(CreatedContainer {
            id: "mock-container".to_string(),
            warnings: vec!["memory limit ignored".to_string()],
        })
    }

    async fn attach_container(&self, _id: &str) -> Result<AttachedStreams, DockerError> {
        self.record("attach");
        let (writer, reader) = tokio::io::duplex(64 * 1024);
        *self.writer.lock().await = Some(writer);

        let (input, mut received) = tokio::io::duplex(1024);
        let stdin = self.stdin.clone();
        tokio::spawn(async move {
            let mut buffer = [0u8; 256];
            while let Ok(n) = received.read(&mut buffer).await {
                if n == 0 {
                    break;
                }
                stdin.lock().unwrap().extend_from_slice(&buffer[..n]);
            }
        });

        Ok(AttachedStreams {
            output: Box::pin(BufReader::new(reader)),
            input: Box::pin(input),
        })
    }

    async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.record("start");
        if self.script.fail_start {
            return Err(DockerError::StartFailed {
                id: id.to_string(),
                reason: "port already allocated".to_string(),
            });
        }

        let writer = self.writer.clone();
        let lines = self.script.lines.clone();
        let hang = self.script.hang;
        let stopped = self.stopped.clone();
        tokio::spawn(async move {
            let mut guard = writer.lock().await;
            if let Some(stream) = guard.as_mut() {
                for line in lines {
                    let _ = stream.write_all(format!("{line}\r\n").as_bytes()).await;
                }
            }
            if !hang {
                guard.take();
                stopped.send_replace(true);
            }
        });
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<Option<i64>, DockerError> {
        self.record("wait");
        if self.script.fail_wait {
            return Err(DockerError::WaitFailed {
                id: id.to_string(),
                reason: "connection reset".to_string(),
            });
        }

        let mut stopped = self.stopped.subscribe();
        let mut removed = self.removed.subscribe();
        tokio::select! {
            _ = stopped.wait_for(|s| *s) => Ok(Some(self.script.exit_code)),
            _ = removed.wait_for(|r| *r) => Ok(None),
        }
    }

    async fn remove_container(&self, _id: &str) -> Result<(), DockerError> {
        self.record("remove");
        self.removals.fetch_add(1, Ordering::SeqCst);
        self.writer.lock().await.take();
        self.removed.send_replace(true);
        Ok(())
    }
}

struct Harness {
    context: RunContext,
    opened: Arc<Mutex<Vec<String>>>,
    exit_code: Arc<AtomicI32>,
}

fn harness() -> Harness {
    let opened = Arc::new(Mutex::new(Vec::new()));
    let exit_code = Arc::new(AtomicI32::new(-1));

    let urls = opened.clone();
    let code = exit_code.clone();
    let context = RunContext::new(AppConfig::for_home("/home/dev", "test"), Telemetry::new())
        .with_signal_source(Arc::new(|| futures::future::pending::<()>().boxed()))
        .with_terminator(Arc::new(move |c| code.store(c, Ordering::SeqCst)))
        .with_url_opener(Arc::new(move |url: &str| {
            urls.lock().unwrap().push(url.to_string());
            Ok(())
        }));

    Harness {
        context,
        opened,
        exit_code,
    }
}

fn runner(runtime: &Arc<MockRuntime>, context: &RunContext) -> ImageRunner {
    ImageRunner::new(runtime.clone(), context.clone()).with_drain_timeout(Duration::from_secs(2))
}

#[tokio::test]
async fn test_successful_run_opens_results_and_removes_once() {
    let h = harness();
    let runtime = MockRuntime::new(Script {
        lines: vec!["Scanning...".to_string(), RESULTS_LINE.to_string()],
        ..Default::default()
    });

    let config = RunOptions::new(&h.context)
        .with_args(vec!["/app/code".to_string()])
        .with_source_volume("/repo")
        .with_ignore_default_rules(true)
        .with_auto_browser_on(vec!["> Continue to view results on:".to_string()])
        .build();

    let outcome = runner(&runtime, &h.context).run(config).await.unwrap();

    assert_eq!(outcome.exit_code, Some(0));
    assert!(!outcome.interrupted);
    let summary = outcome.output.unwrap();
    assert_eq!(summary.lines, 2);
    assert_eq!(summary.reactions, 1);

    assert_eq!(
        *h.opened.lock().unwrap(),
        vec!["https://app.privado.ai/r/abc123".to_string()]
    );
    assert_eq!(runtime.removals(), 1);
    assert_eq!(
        runtime.calls(),
        vec!["create", "attach", "start", "wait", "remove"]
    );

    let metrics = h.context.telemetry.metrics();
    assert_eq!(
        metrics.get("didAutoSpawnBrowser"),
        Some(&MetricValue::Atomic("true".to_string()))
    );
    assert_eq!(
        metrics.get("dockerCmd"),
        Some(&MetricValue::Atomic("/app/code -i".to_string()))
    );
    assert_eq!(
        metrics.get("warning"),
        Some(&MetricValue::Array(vec!["memory limit ignored".to_string()]))
    );

    let specs = runtime.specs.lock().unwrap();
    assert_eq!(specs[0].image, "public.ecr.aws/privado/cli:test");
    assert_eq!(specs[0].cmd, vec!["/app/code", "-i"]);
    assert_eq!(specs[0].mounts.len(), 1);
    assert_eq!(specs[0].mounts[0].container_path, "/app/code");
}

#[tokio::test]
async fn test_forwarded_input_reaches_container() {
    let h = harness();
    let context = h
        .context
        .clone()
        .with_input_source(Arc::new(|| Box::new(std::io::Cursor::new(b"y\n".to_vec()))));
    let runtime = MockRuntime::new(Script {
        lines: vec!["Upload results? (y/N)".to_string()],
        ..Default::default()
    });

    let config = RunOptions::new(&context)
        .with_attached_output()
        .with_forwarded_stdin()
        .build();
    let outcome = runner(&runtime, &context).run(config).await.unwrap();
    assert_eq!(outcome.exit_code, Some(0));

    tokio::time::timeout(Duration::from_secs(2), async {
        while runtime.stdin.lock().unwrap().as_slice() != b"y\n" {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("forwarded input should reach the container");
    assert_eq!(runtime.removals(), 1);
}

#[tokio::test]
async fn test_input_not_forwarded_unless_requested() {
    let h = harness();
    let context = h
        .context
        .clone()
        .with_input_source(Arc::new(|| Box::new(std::io::Cursor::new(b"y\n".to_vec()))));
    let runtime = MockRuntime::new(Script::default());

    let config = RunOptions::new(&context).with_attached_output().build();
    runner(&runtime, &context).run(config).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(runtime.stdin.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_no_attach_without_triggers_or_output() {
    let h = harness();
    let runtime = MockRuntime::new(Script {
        exit_code: 2,
        ..Default::default()
    });

    let config = RunOptions::new(&h.context).build();
    let outcome = runner(&runtime, &h.context).run(config).await.unwrap();

    assert_eq!(outcome.exit_code, Some(2));
    assert!(outcome.output.is_none());
    assert_eq!(runtime.calls(), vec!["create", "start", "wait", "remove"]);
}

#[tokio::test]
async fn test_pull_failure_aborts_before_create() {
    let h = harness();
    let runtime = MockRuntime::new(Script {
        fail_pull: true,
        ..Default::default()
    });

    let config = RunOptions::new(&h.context).with_latest_image(true).build();
    let err = runner(&runtime, &h.context).run(config).await.unwrap_err();

    assert!(matches!(err, DockerError::PullFailed { .. }));
    assert_eq!(runtime.calls(), vec!["pull"]);
    assert_eq!(runtime.removals(), 0);
}

#[tokio::test]
async fn test_create_failure_skips_removal() {
    let h = harness();
    let runtime = MockRuntime::new(Script {
        fail_create: true,
        ..Default::default()
    });

    let err = runner(&runtime, &h.context)
        .run(RunOptions::new(&h.context).build())
        .await
        .unwrap_err();

    assert!(matches!(err, DockerError::CreateFailed(_)));
    assert_eq!(runtime.removals(), 0);
}

#[tokio::test]
async fn test_start_failure_still_removes() {
    let h = harness();
    let runtime = MockRuntime::new(Script {
        fail_start: true,
        ..Default::default()
    });

    let config = RunOptions::new(&h.context).with_attached_output().build();
    let err = runner(&runtime, &h.context).run(config).await.unwrap_err();

    assert!(matches!(err, DockerError::StartFailed { .. }));
    assert_eq!(runtime.removals(), 1);
    assert_eq!(runtime.calls(), vec!["create", "attach", "start", "remove"]);
}

#[tokio::test]
async fn test_wait_failure_still_removes() {
    let h = harness();
    let runtime = MockRuntime::new(Script {
        fail_wait: true,
        ..Default::default()
    });

    let err = runner(&runtime, &h.context)
        .run(RunOptions::new(&h.context).build())
        .await
        .unwrap_err();

    assert!(matches!(err, DockerError::WaitFailed { .. }));
    assert_eq!(runtime.removals(), 1);
}

#[tokio::test]
async fn test_exit_on_error_tears_down_and_fails() {
    let h = harness();
    let runtime = MockRuntime::new(Script {
        lines: vec!["Working".to_string(), "  FATAL: engine crashed  ".to_string()],
        hang: true,
        ..Default::default()
    });

    let config = RunOptions::new(&h.context)
        .with_exit_on_error(vec!["FATAL".to_string()])
        .build();
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        runner(&runtime, &h.context).run(config),
    )
    .await
    .unwrap()
    .unwrap_err();

    match err {
        DockerError::ContainerReportedError(line) => assert_eq!(line, "FATAL: engine crashed"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(runtime.removals(), 1);
}

#[tokio::test]
#[serial]
async fn test_interrupt_removes_once_and_terminates() {
    let h = harness();
    let context = h.context.clone().with_signal_source(Arc::new(|| {
        tokio::time::sleep(Duration::from_millis(50)).boxed()
    }));
    let runtime = MockRuntime::new(Script {
        hang: true,
        ..Default::default()
    });

    let config = RunOptions::new(&context).with_interrupt().build();
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        runner(&runtime, &context).run(config),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(outcome.interrupted);
    assert_eq!(outcome.exit_code, None);
    assert_eq!(h.exit_code.load(Ordering::SeqCst), 0);
    assert_eq!(runtime.removals(), 1);
    assert!(!privado_cli::execution::interrupt::is_installed());
}

#[tokio::test]
#[serial]
async fn test_interrupt_uninstalled_after_normal_completion() {
    let h = harness();
    let runtime = MockRuntime::new(Script::default());

    let config = RunOptions::new(&h.context).with_interrupt().build();
    let outcome = runner(&runtime, &h.context).run(config).await.unwrap();

    assert!(!outcome.interrupted);
    assert_eq!(h.exit_code.load(Ordering::SeqCst), -1);
    assert!(!privado_cli::execution::interrupt::is_installed());
    assert_eq!(runtime.removals(), 1);
}

#[tokio::test]
async fn test_docker_access_key_pulls_when_requested() {
    let h = harness();
    let runtime = MockRuntime::new(Script::default());

    let key = runner(&runtime, &h.context)
        .docker_access_key(true)
        .await
        .unwrap();

    assert_eq!(key, "access");
    assert_eq!(runtime.calls(), vec!["pull", "inspect"]);
}
