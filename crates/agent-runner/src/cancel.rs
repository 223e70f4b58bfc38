//! Cooperative cancellation
//!
//! The signal is shared by every run in the process. It is never used to
//! abort an in-flight remote call: the step loop polls it at fixed
//! checkpoints (before prediction, before execution, before screenshot
//! capture) and unwinds through its clean-exit path when exit is requested.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Outcome of a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    Exit,
}

impl Checkpoint {
    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exit)
    }
}

/// Process-wide pause/resume/exit flag.
///
/// Created once at process start and handed to every run. Pause is operator
/// state: starting a run never touches it, so a run dispatched while paused
/// blocks at its first checkpoint. The exit latch is one-way.
#[derive(Debug)]
pub struct CancellationSignal {
    exit: CancellationToken,
    paused: watch::Sender<bool>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            exit: CancellationToken::new(),
            paused,
        }
    }

    /// Latch the exit flag. Cannot be undone.
    pub fn request_exit(&self) {
        if !self.exit.is_cancelled() {
            info!("Exit requested; runs will stop at their next checkpoint");
        }
        self.exit.cancel();
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.is_cancelled()
    }

    /// Token that is cancelled once exit is requested
    pub fn exit_token(&self) -> CancellationToken {
        self.exit.clone()
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Block while paused. Returns immediately when not paused, and early
    /// when exit is requested.
    pub async fn wait_for_resume(&self) {
        let mut rx = self.paused.subscribe();
        loop {
            let paused = *rx.borrow_and_update();
            if !paused || self.exit_requested() {
                return;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = self.exit.cancelled() => return,
            }
        }
    }

    /// Sleep for `duration`, returning early if exit is requested.
    ///
    /// Returns `false` when the sleep was cut short.
    pub async fn sleep_interruptible(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.exit_requested();
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.exit_requested(),
            _ = self.exit.cancelled() => false,
        }
    }

    /// Reset the signal for a fresh session of a single-run embedder. The
    /// exit latch is left untouched. Runs sharing the signal never call it.
    pub fn clear_state(&self) {
        self.paused.send_replace(false);
    }

    /// Poll the signal at a loop boundary: exit wins, pause blocks.
    pub async fn checkpoint(&self) -> Checkpoint {
        if self.exit_requested() {
            return Checkpoint::Exit;
        }
        if self.is_paused() {
            info!("Run paused by operator; waiting for resume");
            self.wait_for_resume().await;
        }
        if self.exit_requested() {
            Checkpoint::Exit
        } else {
            Checkpoint::Continue
        }
    }

    /// Latch exit on Ctrl+C and, on unix, SIGTERM
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let signal = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received Ctrl+C, requesting clean exit");
                signal.request_exit();
            }
        });

        #[cfg(unix)]
        {
            let signal = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal as unix_signal, SignalKind};
                if let Ok(mut sigterm) = unix_signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    info!("Received SIGTERM, requesting clean exit");
                    signal.request_exit();
                }
            });
        }
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}
