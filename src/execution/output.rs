//! Line-oriented processing of attached container output.
//!
//! The processor reads the combined output stream one line at a time, echoes
//! it when output is attached, and checks every line against the registered
//! triggers. Matching reactions are spawned as tasks so a slow reaction never
//! holds up reading; they are only awaited once the stream ends.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::{JoinHandle, JoinSet};

/// Reaction invoked with the trimmed matching line.
pub type Reaction = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure as a [`Reaction`].
pub fn reaction<F, Fut>(f: F) -> Reaction
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |line| f(line).boxed())
}

/// A set of substring patterns sharing one reaction.
#[derive(Clone)]
pub struct OutputTrigger {
    pub patterns: Vec<String>,
    pub reaction: Reaction,
}

impl std::fmt::Debug for OutputTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputTrigger")
            .field("patterns", &self.patterns)
            .finish_non_exhaustive()
    }
}

impl OutputTrigger {
    pub fn new(patterns: Vec<String>, reaction: Reaction) -> Self {
        Self { patterns, reaction }
    }

    /// Whether any pattern occurs in `line`.
    pub fn matches(&self, line: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| line.contains(pattern.as_str()))
    }
}

/// Counters reported when the stream ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputSummary {
    pub lines: usize,
    pub reactions: usize,
}

/// Consumes an output stream and dispatches trigger reactions.
pub struct OutputProcessor {
    triggers: Vec<OutputTrigger>,
    echo: Option<Box<dyn Write + Send>>,
}

impl OutputProcessor {
    pub fn new(triggers: Vec<OutputTrigger>) -> Self {
        Self {
            triggers,
            echo: None,
        }
    }

    /// Echoes every line verbatim to `writer`.
    pub fn with_echo(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.echo = Some(writer);
        self
    }

    pub fn with_stdout_echo(self) -> Self {
        self.with_echo(Box::new(std::io::stdout()))
    }

    /// Processes `reader` on a background task.
    pub fn spawn<R>(self, reader: R) -> JoinHandle<OutputSummary>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        tokio::spawn(self.process(reader))
    }

    /// Reads `reader` to the end, then waits for outstanding reactions.
    pub async fn process<R>(mut self, mut reader: R) -> OutputSummary
    where
        R: AsyncBufRead + Unpin,
    {
        let mut summary = OutputSummary::default();
        let mut reactions = JoinSet::new();
        let mut buffer = Vec::new();

        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "Container output stream closed");
                    break;
                }
            }
            summary.lines += 1;

            let line = String::from_utf8_lossy(&buffer);
            if let Some(echo) = self.echo.as_mut() {
                if let Err(e) = echo.write_all(line.as_bytes()).and_then(|_| echo.flush()) {
                    tracing::debug!(error = %e, "Failed to echo container output");
                }
            }

            let trimmed = line.strip_suffix('\n').unwrap_or(&line).trim();
            for trigger in self.triggers.iter().filter(|t| t.matches(&line)) {
                reactions.spawn((trigger.reaction)(trimmed.to_string()));
                summary.reactions += 1;
            }

            while let Some(finished) = reactions.try_join_next() {
                log_reaction_result(finished);
            }
        }

        while let Some(finished) = reactions.join_next().await {
            log_reaction_result(finished);
        }

        summary
    }
}

fn log_reaction_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "Output reaction failed");
    }
}
