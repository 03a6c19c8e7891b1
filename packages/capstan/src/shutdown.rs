//! Two-stage shutdown coordination.
//!
//! Operator protocol:
//! - `SIGINT` — first receipt requests graceful shutdown (stop
//!   dispatching, let in-flight jobs finish). A second receipt upgrades
//!   to forced shutdown (interrupt every slot). Further receipts are
//!   no-ops: the process is already on its way out.
//! - `SIGTERM` — forced shutdown immediately.
//!
//! The controller carries two [`CancellationToken`]s. The `stop` token
//! breaks the dispatch loop; the `kill` token additionally tells the
//! worker to interrupt the pool. Forced shutdown cancels both.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Coordinates graceful and forced shutdown across the worker's loops.
#[derive(Clone, Debug, Default)]
pub struct ShutdownController {
    stop: CancellationToken,
    kill: CancellationToken,
    interrupts: Arc<AtomicU32>,
}

impl ShutdownController {
    /// Create a controller with no shutdown requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when the dispatch loop should stop.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Token cancelled when in-flight jobs should be interrupted.
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Whether any shutdown (graceful or forced) has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Whether forced shutdown has been requested.
    pub fn is_forced(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// Request graceful shutdown: stop dispatching, drain the pool.
    pub fn request_graceful(&self) {
        info!("graceful shutdown requested");
        self.stop.cancel();
    }

    /// Request forced shutdown: interrupt every slot, then exit.
    pub fn request_forced(&self) {
        info!("forced shutdown requested");
        self.kill.cancel();
        self.stop.cancel();
    }

    /// Register one interrupt (Ctrl-C) press.
    ///
    /// First press: graceful. Second press: forced. Later presses: the
    /// process is already exiting, ignore.
    pub fn press_interrupt(&self) {
        let presses = self.interrupts.fetch_add(1, Ordering::SeqCst) + 1;
        match presses {
            1 => self.request_graceful(),
            2 => self.request_forced(),
            _ => {}
        }
    }

    /// Install the operator signal handlers on the current runtime.
    ///
    /// Failing to install handlers is fatal for the worker: without
    /// them the process cannot be stopped cleanly.
    #[cfg(unix)]
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sigint.recv() => controller.press_interrupt(),
                    _ = sigterm.recv() => controller.request_forced(),
                }
            }
        });

        Ok(())
    }
}
