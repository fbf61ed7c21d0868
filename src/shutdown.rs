//! Graceful shutdown coordination utilities.
//!
//! A [`ShutdownCoordinator`] is shared by the lister, the workers and the
//! executor. It moves through `Running -> Draining -> Stopped`:
//!
//! - the first termination request (or a structural abort) starts draining:
//!   no new pages are listed, queued tasks are not dequeued, tasks already
//!   in flight finish with their remaining retry budget;
//! - a second termination request while draining forces exit: every pending
//!   wait (backoff, admission, remote call) is abandoned at its next
//!   suspension point;
//! - the executor marks the coordinator stopped once the final checkpoint was
//!   written.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{info, warn};

/// Shared handle to a shutdown coordinator.
pub type SharedShutdown = Arc<ShutdownCoordinator>;

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Normal operation
    Running,
    /// Finishing in-flight work, refusing new work
    Draining,
    /// Final checkpoint written
    Stopped,
}

impl ShutdownPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ShutdownPhase::Running,
            1 => ShutdownPhase::Draining,
            _ => ShutdownPhase::Stopped,
        }
    }
}

/// Effect of a termination request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    /// First request: draining started
    Drain,
    /// Repeated request: immediate exit
    Force,
}

/// Coordinates graceful shutdown across async tasks.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    phase: AtomicU8,
    forced: AtomicBool,
    abort_reason: Mutex<Option<String>>,
    drain_notify: Notify,
    force_notify: Notify,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Create a new coordinator.
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(ShutdownPhase::Running as u8),
            forced: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            drain_notify: Notify::new(),
            force_notify: Notify::new(),
        }
    }

    /// Create a new shared coordinator wrapped in [`Arc`].
    pub fn shared() -> SharedShutdown {
        Arc::new(Self::new())
    }

    /// Handle a termination signal.
    pub fn request_shutdown(&self) -> ShutdownRequest {
        if self.begin_drain() {
            info!("Shutdown requested, draining in-flight downloads (repeat to force exit)");
            ShutdownRequest::Drain
        } else {
            if !self.forced.swap(true, Ordering::SeqCst) {
                warn!("Second shutdown request, forcing exit");
                self.force_notify.notify_waiters();
            }
            ShutdownRequest::Force
        }
    }

    /// Start an orderly abort after a structural failure.
    ///
    /// Only the first reason is kept.
    pub fn abort(&self, reason: impl Into<String>) {
        {
            let mut slot = self.abort_reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.begin_drain();
    }

    fn begin_drain(&self) -> bool {
        let started = self
            .phase
            .compare_exchange(
                ShutdownPhase::Running as u8,
                ShutdownPhase::Draining as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if started {
            self.drain_notify.notify_waiters();
        }
        started
    }

    /// Record that the final checkpoint was written.
    pub fn mark_stopped(&self) {
        self.phase
            .store(ShutdownPhase::Stopped as u8, Ordering::SeqCst);
    }

    /// Current phase
    pub fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.phase() != ShutdownPhase::Running
    }

    /// Whether a forced exit was requested.
    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    /// Reason given to [`abort`](Self::abort), if any
    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait until draining starts. Returns immediately if already set.
    pub async fn wait_for_shutdown(&self) {
        loop {
            // notify_waiters only reaches futures created before the call
            let notified = self.drain_notify.notified();
            if self.is_shutdown_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Wait until a forced exit is requested.
    pub async fn wait_for_force(&self) {
        loop {
            let notified = self.force_notify.notified();
            if self.is_forced() {
                return;
            }
            notified.await;
        }
    }
}
