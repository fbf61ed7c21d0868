//! Shared admission control for outbound calls
//!
//! One [`RateLimiter`] gates every listing and download call in a run. A call
//! is admitted once both:
//! - fewer than `max_concurrent` permits are outstanding, and
//! - fewer than `max_requests` calls were admitted in the trailing window.
//!
//! The window is a sliding log of admission instants: any interval of length
//! `window` contains at most `max_requests` admissions. Window budget is
//! consumed on admission and only comes back as old admissions age out;
//! dropping a [`RatePermit`] returns the concurrency slot only.
//!
//! Waiters are served first-come-first-served: both the semaphore and the
//! budget mutex are FIFO-fair in tokio.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use super::config::RateLimitConfig;
use crate::metrics::RateLimiterMetrics;

/// Wait used when a window end cannot be represented as an instant
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// Admission instants inside the trailing window
#[derive(Debug, Default)]
struct RateBudget {
    admitted: VecDeque<Instant>,
}

impl RateBudget {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.admitted.front() {
            if oldest.checked_add(window).is_some_and(|expiry| expiry <= now) {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Rate and concurrency limiter shared across the pipeline
#[derive(Debug)]
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    budget: Mutex<RateBudget>,
    max_requests: usize,
    max_concurrent: usize,
    window: Duration,
}

impl RateLimiter {
    /// Create a limiter
    ///
    /// # Arguments
    /// * `max_requests` - Maximum admissions within any `window`
    /// * `window` - Length of the sliding window
    /// * `max_concurrent` - Maximum outstanding permits
    pub fn new(max_requests: usize, window: Duration, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            budget: Mutex::new(RateBudget {
                admitted: VecDeque::with_capacity(max_requests.min(4096)),
            }),
            max_requests: max_requests.max(1),
            max_concurrent,
            window,
        }
    }

    /// Create a limiter from configuration
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.max_requests_per_window,
            config.window,
            config.max_concurrent,
        )
    }

    /// Wait for admission.
    ///
    /// Suspends until a concurrency slot is free and the window has budget
    /// left. The returned permit holds the slot until dropped.
    pub async fn acquire(&self) -> Result<RatePermit, RateLimitError> {
        let mut metrics = RateLimiterMetrics::new();
        metrics.start_acquire();

        let slot = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| RateLimitError::AcquireError(e.to_string()))?;

        let admitted_at = {
            let mut budget = self.budget.lock().await;
            loop {
                let now = Instant::now();
                budget.prune(now, self.window);
                if budget.admitted.len() < self.max_requests {
                    budget.admitted.push_back(now);
                    break now;
                }
                // Holding the lock keeps later waiters queued behind this one
                let wake_at = match budget.admitted.front() {
                    Some(&oldest) => oldest
                        .checked_add(self.window)
                        .unwrap_or_else(|| now + FAR_FUTURE),
                    None => now,
                };
                debug!(
                    wait_ms = wake_at.saturating_duration_since(now).as_millis() as u64,
                    "Rate window exhausted, waiting for budget"
                );
                sleep_until(wake_at).await;
            }
        };

        metrics.record_acquired();
        metrics.update_available_permits(self.semaphore.available_permits());

        Ok(RatePermit {
            _slot: slot,
            admitted_at,
        })
    }

    /// Number of permits currently held
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    /// Admissions counted in the current trailing window
    pub async fn admitted_in_window(&self) -> usize {
        let mut budget = self.budget.lock().await;
        budget.prune(Instant::now(), self.window);
        budget.admitted.len()
    }

    /// Stop admitting; pending and future `acquire` calls fail
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// Admission to make one outbound call
///
/// Dropping the permit returns the concurrency slot.
#[derive(Debug)]
pub struct RatePermit {
    _slot: OwnedSemaphorePermit,
    admitted_at: Instant,
}

impl RatePermit {
    /// When the call was admitted
    pub fn admitted_at(&self) -> Instant {
        self.admitted_at
    }

    /// Return the concurrency slot
    pub fn release(self) {}
}

/// Rate limiter errors
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// Failed to acquire permits
    #[error("failed to acquire rate limit permit: {0}")]
    AcquireError(String),
}
