//! Process-wide interrupt coordination for a running container.
//!
//! At most one handler is installed at a time. The handler waits for the
//! signal future, then runs its action (typically: announce, remove the
//! container, terminate the process). The returned [`InterruptGuard`]
//! uninstalls the handler when released or dropped, so every exit path of a
//! run clears it.
//!
//! ```text
//! uninstalled -> installed -> fired
//!                          -> uninstalled
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::InterruptError;

static HANDLER_ACTIVE: AtomicBool = AtomicBool::new(false);

const INSTALLED: u8 = 0;
const FIRED: u8 = 1;
const UNINSTALLED: u8 = 2;

/// Lifecycle state of an installed handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptState {
    Installed,
    Fired,
    Uninstalled,
}

impl InterruptState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            INSTALLED => InterruptState::Installed,
            FIRED => InterruptState::Fired,
            _ => InterruptState::Uninstalled,
        }
    }
}

/// Whether any interrupt handler is currently installed.
pub fn is_installed() -> bool {
    HANDLER_ACTIVE.load(Ordering::SeqCst)
}

/// Installs the process-wide handler.
///
/// `action` runs once, after `signal` resolves, unless the guard was released
/// first.
///
/// # Errors
///
/// Returns [`InterruptError::AlreadyInstalled`] while another guard is alive.
pub fn install<S, A, Fut>(signal: S, action: A) -> Result<InterruptGuard, InterruptError>
where
    S: Future<Output = ()> + Send + 'static,
    A: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if HANDLER_ACTIVE
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(InterruptError::AlreadyInstalled);
    }

    let state = Arc::new(AtomicU8::new(INSTALLED));
    let task_state = state.clone();
    let task = tokio::spawn(async move {
        signal.await;
        if task_state
            .compare_exchange(INSTALLED, FIRED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::debug!("Interrupt received");
            action().await;
        }
    });

    Ok(InterruptGuard {
        state,
        task: Some(task),
    })
}

/// Keeps the interrupt handler installed while alive.
#[derive(Debug)]
pub struct InterruptGuard {
    state: Arc<AtomicU8>,
    task: Option<JoinHandle<()>>,
}

impl InterruptGuard {
    pub fn state(&self) -> InterruptState {
        InterruptState::from_raw(self.state.load(Ordering::SeqCst))
    }

    pub fn has_fired(&self) -> bool {
        self.state() == InterruptState::Fired
    }

    /// Uninstalls the handler.
    ///
    /// If the handler already fired, its action is awaited before returning.
    /// Returns the state the handler ended in.
    pub async fn release(mut self) -> InterruptState {
        let uninstalled = self
            .state
            .compare_exchange(INSTALLED, UNINSTALLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();

        if uninstalled {
            return InterruptState::Uninstalled;
        }

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Interrupt action failed");
            }
        }
        InterruptState::Fired
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        let _ = self.state.compare_exchange(
            INSTALLED,
            UNINSTALLED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if let Some(task) = self.task.take() {
            task.abort();
        }
        HANDLER_ACTIVE.store(false, Ordering::SeqCst);
    }
}
