//! Retry controller with capped exponential backoff
//!
//! [`RetryController::execute`] wraps one outbound call. Each attempt first
//! takes a [`RateLimiter`] permit and holds it for the duration of the call.
//!
//! Retries on:
//! - Network errors (timeout, connection refused)
//! - 5xx server errors
//! - 429 rate limit errors
//!
//! Does not retry on:
//! - 4xx client errors (except 429), including not-found and auth failures
//!
//! Delay after failed attempt `n` (1-based) is
//! `min(base * 2^(n-1), max)` plus jitter in `[0, delay)` when enabled.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::config::RetryPolicy;
use super::rate_limit::{RateLimitError, RateLimiter};
use crate::metrics::{record_request, record_retry_backoff};
use crate::remote::{ErrorClass, KvError, KvResult};
use crate::shutdown::SharedShutdown;

/// A retry that is about to happen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEvent {
    /// Operation name ("list" or "get")
    pub operation: &'static str,
    /// Key name or cursor the call targets
    pub target: String,
    /// Attempt that just failed (1-based)
    pub attempt: u32,
    /// Configured attempt ceiling
    pub max_attempts: u32,
    /// Classification of the failure
    pub class: ErrorClass,
    /// Capped exponential delay before the next attempt
    pub delay: Duration,
    /// Random jitter added on top of `delay`
    pub jitter: Duration,
    /// Failure detail
    pub error: String,
}

impl RetryEvent {
    /// Total wait before the next attempt
    pub fn total_delay(&self) -> Duration {
        self.delay + self.jitter
    }

    /// Standardized retry message with attempt counters and context.
    pub fn format_retry(&self) -> String {
        format!(
            "Retrying {} '{}' (attempt {}/{}) after {} - waiting {:.1} seconds...",
            self.operation,
            self.target,
            self.attempt + 1,
            self.max_attempts,
            self.class.description(),
            self.total_delay().as_secs_f64()
        )
    }
}

/// Callback receiving every [`RetryEvent`]
pub type RetryObserver = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// Why a wrapped call did not produce a value
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// Non-retryable failure
    #[error("permanent failure on attempt {attempts}: {error}")]
    Permanent {
        /// Attempts made
        attempts: u32,
        /// The failure
        error: KvError,
    },

    /// Every attempt failed transiently
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Last failure seen
        last: KvError,
    },

    /// Forced shutdown interrupted the call
    #[error("cancelled by shutdown")]
    Cancelled,

    /// Limiter closed
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}

impl RetryError {
    /// The remote failure behind this error, if any
    pub fn kv_error(&self) -> Option<&KvError> {
        match self {
            RetryError::Permanent { error, .. } => Some(error),
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Cancelled | RetryError::RateLimit(_) => None,
        }
    }
}

/// Wraps outbound calls with admission control and retries
#[derive(Clone)]
pub struct RetryController {
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    shutdown: Option<SharedShutdown>,
    observer: Option<RetryObserver>,
}

impl RetryController {
    /// Create a controller sharing `limiter`
    pub fn new(limiter: Arc<RateLimiter>, policy: RetryPolicy) -> Self {
        Self {
            limiter,
            policy,
            shutdown: None,
            observer: None,
        }
    }

    /// Abort waits when a forced shutdown is requested
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Receive a callback for every scheduled retry
    pub fn with_observer(mut self, observer: RetryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run `call` until it succeeds, fails permanently, or runs out of attempts.
    ///
    /// `attempt` is incremented before every call and never exceeds
    /// `policy.max_attempts`.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &'static str,
        target: &str,
        attempt: &mut u32,
        mut call: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = KvResult<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);

        loop {
            if *attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: *attempt,
                    last: KvError::new(ErrorClass::InvalidResponse, "no attempts left"),
                });
            }
            *attempt += 1;

            let permit = self.cancellable(self.limiter.acquire()).await??;
            debug!(
                operation,
                target,
                attempt = *attempt,
                max_attempts,
                "Starting attempt"
            );
            let result = self.cancellable(call()).await?;
            permit.release();

            let error = match result {
                Ok(value) => {
                    record_request(operation, "ok");
                    if *attempt > 1 {
                        debug!(
                            operation,
                            target,
                            attempt = *attempt,
                            "Retry attempt {}/{} succeeded",
                            *attempt,
                            max_attempts
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };
            record_request(operation, error.class().description());

            if !error.is_transient() {
                debug!(operation, target, attempt = *attempt, error = %error, "Permanent failure");
                return Err(RetryError::Permanent {
                    attempts: *attempt,
                    error,
                });
            }

            if *attempt >= max_attempts {
                warn!(
                    operation,
                    target,
                    attempts = *attempt,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts: *attempt,
                    last: error,
                });
            }

            let delay = self.policy.backoff(*attempt - 1);
            let jitter = if self.policy.jitter {
                random_jitter(delay)
            } else {
                Duration::ZERO
            };
            let event = RetryEvent {
                operation,
                target: target.to_string(),
                attempt: *attempt,
                max_attempts,
                class: error.class(),
                delay,
                jitter,
                error: error.to_string(),
            };
            self.emit(&event);

            self.cancellable(tokio::time::sleep(event.total_delay()))
                .await?;
        }
    }

    fn emit(&self, event: &RetryEvent) {
        warn!(
            operation = event.operation,
            target = %event.target,
            attempt = event.attempt,
            max_attempts = event.max_attempts,
            backoff_ms = event.delay.as_millis() as u64,
            jitter_ms = event.jitter.as_millis() as u64,
            error = %event.error,
            "{}",
            event.format_retry()
        );
        record_retry_backoff(event.operation, event.total_delay(), event.attempt);
        if let Some(observer) = &self.observer {
            observer(event);
        }
    }

    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, RetryError> {
        match &self.shutdown {
            Some(shutdown) => {
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for_force() => Err(RetryError::Cancelled),
                    out = fut => Ok(out),
                }
            }
            None => Ok(fut.await),
        }
    }
}

/// Uniform jitter in `[0, delay)`
fn random_jitter(delay: Duration) -> Duration {
    let micros = delay.as_micros().min(u64::MAX as u128) as u64;
    if micros == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(rand::thread_rng().gen_range(0..micros))
}
