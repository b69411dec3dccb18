//! Explicit per-process context shared by the option builder and the
//! container lifecycle.
//!
//! Besides configuration and telemetry, the context carries the process side
//! effects a run may trigger: waiting for an interrupt signal, reading the
//! terminal's input, exiting the process and opening a URL. Each can be
//! replaced for embedding or testing.
//!
//! Process signals are owned by one listener that lives as long as the
//! process. It hands each signal to the installed interrupt handler, or exits
//! with status 130 when no handler is installed, so Ctrl-C keeps working
//! between runs.

use std::future::Future;
use std::io::{self, Read};
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::execution::interrupt;
use crate::telemetry::Telemetry;
use crate::utils::open_url_in_browser;

/// Exit status used when a signal arrives with no handler installed.
pub const UNHANDLED_SIGNAL_EXIT_CODE: i32 = 130;

/// Future resolving when the user asks the process to stop.
pub type SignalSource = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Terminates the process with the given exit code.
pub type Terminator = Arc<dyn Fn(i32) + Send + Sync>;

/// Opens a URL for the user.
pub type UrlOpener = Arc<dyn Fn(&str) -> io::Result<()> + Send + Sync>;

/// Produces the reader whose bytes are forwarded to the container's stdin.
pub type InputSource = Arc<dyn Fn() -> Box<dyn Read + Send> + Send + Sync>;

/// Shared state for one CLI invocation.
#[derive(Clone)]
pub struct RunContext {
    pub app: Arc<AppConfig>,
    pub telemetry: Telemetry,
    signal_source: SignalSource,
    terminator: Terminator,
    url_opener: UrlOpener,
    input_source: InputSource,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("app", &self.app)
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Creates a context using the real process signals, exit and browser.
    pub fn new(app: AppConfig, telemetry: Telemetry) -> Self {
        Self {
            app: Arc::new(app),
            telemetry,
            signal_source: Arc::new(process_signal),
            terminator: Arc::new(|code: i32| std::process::exit(code)),
            url_opener: Arc::new(open_url_in_browser),
            input_source: Arc::new(|| Box::new(io::stdin())),
        }
    }

    /// Replaces the interrupt signal source.
    pub fn with_signal_source(mut self, source: SignalSource) -> Self {
        self.signal_source = source;
        self
    }

    /// Replaces the process terminator.
    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = terminator;
        self
    }

    /// Replaces the URL opener.
    pub fn with_url_opener(mut self, opener: UrlOpener) -> Self {
        self.url_opener = opener;
        self
    }

    /// Replaces the source of forwarded input.
    pub fn with_input_source(mut self, source: InputSource) -> Self {
        self.input_source = source;
        self
    }

    pub fn signal(&self) -> BoxFuture<'static, ()> {
        (self.signal_source)()
    }

    pub fn terminate(&self, code: i32) {
        (self.terminator)(code)
    }

    pub fn open_url(&self, url: &str) -> io::Result<()> {
        (self.url_opener)(url)
    }

    pub fn input(&self) -> Box<dyn Read + Send> {
        (self.input_source)()
    }
}

static SIGNAL_ROUTER: OnceLock<broadcast::Sender<()>> = OnceLock::new();

/// Subscribes to the process signal router, starting it on first use.
///
/// The subscription is taken immediately, so a signal arriving after this
/// call and before the first poll is not lost.
fn process_signal() -> BoxFuture<'static, ()> {
    let router = SIGNAL_ROUTER.get_or_init(|| {
        let (sender, _) = broadcast::channel(4);
        let handlers = sender.clone();
        tokio::spawn(route_signals(shutdown_signal, handlers, || {
            std::process::exit(UNHANDLED_SIGNAL_EXIT_CODE);
        }));
        sender
    });

    let mut receiver = router.subscribe();
    async move {
        let _ = receiver.recv().await;
    }
    .boxed()
}

/// Hands every signal from `next_signal` to the subscribed interrupt handler.
///
/// `unhandled` runs when no handler is installed or none is listening.
pub(crate) async fn route_signals<N, F, U>(
    mut next_signal: N,
    handlers: broadcast::Sender<()>,
    unhandled: U,
) where
    N: FnMut() -> F,
    F: Future<Output = ()>,
    U: Fn(),
{
    loop {
        next_signal().await;
        let delivered = interrupt::is_installed() && handlers.send(()).is_ok();
        if !delivered {
            tracing::debug!("Signal received with no interrupt handler installed");
            unhandled();
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
