//! Graceful shutdown handling for the aesdsocket server.
//!
//! A termination signal sets the process-wide [`ShutdownSignal`]. The dispatch
//! loop then stops accepting and the [`DrainCoordinator`] runs the drain
//! sequence:
//! 1. Stop the timestamp injector and join it
//! 2. Join every outstanding connection task, aborting stragglers after the
//!    grace period
//! 3. Remove the shared log's backing file

use crate::server::{ServerContext, TimestampInjector};
use aesd_core::{AesdError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Default grace period for outstanding connections during drain
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-wide shutdown state.
///
/// The flag is monotonic and may be polled without a lock; the broadcast
/// channel wakes tasks parked in a blocking wait.
#[derive(Debug)]
pub struct ShutdownSignal {
    requested: AtomicBool,
    tx: broadcast::Sender<()>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            requested: AtomicBool::new(false),
            tx,
        }
    }

    /// Check if shutdown has been requested
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Request shutdown. Returns false if it had already been requested.
    pub fn trigger(&self) -> bool {
        if self.requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(());
        true
    }

    /// Resolve once shutdown has been requested.
    ///
    /// Subscribes before checking the flag so a trigger racing with this call
    /// is never missed. Cancel safe.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        if self.is_requested() {
            return;
        }
        let _ = rx.recv().await;
    }
}

#[cfg(unix)]
pub fn install_signal_handlers(
    shutdown: Arc<ShutdownSignal>,
) -> Result<impl std::future::Future<Output = ()> + Send + 'static> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| AesdError::Setup(format!("failed to install SIGTERM handler: {e}")))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| AesdError::Setup(format!("failed to install SIGINT handler: {e}")))?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!(target: "aesdsocket::shutdown", signal = "SIGTERM", "Caught signal, exiting");
            }
            _ = sigint.recv() => {
                info!(target: "aesdsocket::shutdown", signal = "SIGINT", "Caught signal, exiting");
            }
        }

        shutdown.trigger();
    })
}

#[cfg(windows)]
pub fn install_signal_handlers(
    shutdown: Arc<ShutdownSignal>,
) -> Result<impl std::future::Future<Output = ()> + Send + 'static> {
    Ok(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(target: "aesdsocket::shutdown", error = %e, "Failed to listen for Ctrl+C");
            return;
        }

        info!(target: "aesdsocket::shutdown", "Caught signal, exiting");
        shutdown.trigger();
    })
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPhase {
    /// Stopping and joining the timestamp injector
    StoppingInjector,
    /// Joining connection tasks
    DrainingWorkers,
    /// Removing the shared log's backing file
    ResettingLog,
    /// Drain complete
    Complete,
}

/// Outcome of a drain sequence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Connection tasks that finished on their own
    pub joined: usize,
    /// Connection tasks aborted after the grace period
    pub aborted: usize,
}

impl DrainReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.aborted == 0
    }
}

/// Runs the drain sequence once the dispatch loop has exited.
///
/// This is the only path that deletes the shared log's backing file.
pub struct DrainCoordinator {
    timeout: Duration,
    phase: DrainPhase,
}

impl DrainCoordinator {
    /// Create a new drain coordinator with the given grace period
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            phase: DrainPhase::StoppingInjector,
        }
    }

    /// Get the current drain phase
    pub fn phase(&self) -> DrainPhase {
        self.phase
    }

    pub async fn execute(
        &mut self,
        ctx: &ServerContext,
        injector: Option<TimestampInjector>,
    ) -> Result<DrainReport> {
        let start = Instant::now();
        info!(
            target: "aesdsocket::shutdown",
            timeout_ms = self.timeout.as_millis(),
            "Beginning drain sequence"
        );

        // The flag is normally already set by the signal handler; setting it
        // here covers callers that stop the server directly.
        ctx.shutdown.trigger();

        // Phase 1: Stop the injector
        self.phase = DrainPhase::StoppingInjector;
        if let Some(injector) = injector {
            if let Err(e) = injector.stop().await {
                warn!(target: "aesdsocket::shutdown", error = %e, "Timestamp injector join failed");
            }
        }

        // Phase 2: Join connection tasks
        self.phase = DrainPhase::DrainingWorkers;
        let report = ctx.registry.drain_all(self.timeout).await;
        if report.is_clean() {
            info!(
                target: "aesdsocket::shutdown",
                joined = report.joined,
                "All connection tasks joined"
            );
        } else {
            warn!(
                target: "aesdsocket::shutdown",
                joined = report.joined,
                aborted = report.aborted,
                "Drain timeout exceeded, aborted remaining connections"
            );
        }

        // Phase 3: Remove the log
        self.phase = DrainPhase::ResettingLog;
        ctx.log.reset()?;

        self.phase = DrainPhase::Complete;
        info!(
            target: "aesdsocket::shutdown",
            elapsed_ms = start.elapsed().as_millis(),
            "Drain sequence complete"
        );

        Ok(report)
    }
}
