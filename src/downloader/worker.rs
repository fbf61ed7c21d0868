//! Download worker pool
//!
//! `W` workers share one queue receiver. Each worker loops: dequeue a task,
//! skip it if the destination exists (unless overwrite is forced), otherwise
//! fetch the value through the retry controller and write it atomically.
//! Per-key failures are recorded and never stop the pool.

use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::BackupConfig;
use super::progress::RunStats;
use super::retry::{RetryController, RetryError};
use super::task::{DownloadTask, Resolution};
use super::DownloadError;
use crate::remote::{ErrorClass, KvNamespace};
use crate::shutdown::SharedShutdown;
use crate::storage;

/// A key that could not be mirrored
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedKey {
    /// Key name
    pub key: String,
    /// Attempts made
    pub attempts: u32,
    /// Failure description
    pub reason: String,
}

/// State shared by every worker
#[derive(Clone)]
pub struct WorkerContext {
    /// Remote namespace
    pub remote: Arc<dyn KvNamespace>,
    /// Retry controller (shares the run's rate limiter)
    pub retry: RetryController,
    /// Run configuration
    pub config: Arc<BackupConfig>,
    /// Shutdown coordinator
    pub shutdown: SharedShutdown,
    /// Run counters
    pub stats: Arc<RunStats>,
}

/// Running set of download workers
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    failures: Arc<Mutex<Vec<FailedKey>>>,
}

impl WorkerPool {
    /// Spawn `ctx.config.workers` workers draining `queue`
    pub fn spawn(ctx: WorkerContext, queue: mpsc::Receiver<DownloadTask>) -> Self {
        let queue = Arc::new(tokio::sync::Mutex::new(queue));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let in_flight = Arc::new(Mutex::new(HashSet::new()));

        let handles = (0..ctx.config.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    ctx: ctx.clone(),
                    queue: queue.clone(),
                    failures: failures.clone(),
                    in_flight: in_flight.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        Self { handles, failures }
    }

    /// Wait for every worker to exit and collect the failed keys
    pub async fn join(self) -> Result<Vec<FailedKey>, DownloadError> {
        for result in join_all(self.handles).await {
            result.map_err(|e| DownloadError::TaskFailed(format!("download worker: {e}")))?;
        }
        let failures = std::mem::take(&mut *self.failures.lock().unwrap_or_else(|e| e.into_inner()));
        Ok(failures)
    }
}

struct Worker {
    id: usize,
    ctx: WorkerContext,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<DownloadTask>>>,
    failures: Arc<Mutex<Vec<FailedKey>>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "Worker started");
        while let Some(task) = self.next_task().await {
            self.process(task).await;
        }
        debug!(worker = self.id, "Worker stopped");
    }

    /// Next task, or `None` once the queue closed or draining began
    async fn next_task(&self) -> Option<DownloadTask> {
        if self.ctx.shutdown.is_shutdown_requested() {
            return None;
        }
        let mut queue = self.queue.lock().await;
        tokio::select! {
            biased;
            _ = self.ctx.shutdown.wait_for_shutdown() => None,
            task = queue.recv() => task,
        }
    }

    async fn process(&self, mut task: DownloadTask) {
        let key = task.key.name.clone();
        if !self.claim(&key) {
            debug!(worker = self.id, key = %key, "Key already in flight, skipping duplicate");
            self.finish(task, Resolution::Skipped);
            return;
        }

        let resolution = self.download(&mut task).await;
        self.unclaim(&key);

        match resolution {
            Some(resolution) => self.finish(task, resolution),
            // Forced exit: dropping the task carries it over
            None => drop(task),
        }
    }

    async fn download(&self, task: &mut DownloadTask) -> Option<Resolution> {
        let config = &self.ctx.config;
        if !config.force_overwrite && storage::exists(&task.destination) {
            self.log_key(&task.key.name, "Destination exists, skipping");
            return Some(Resolution::Skipped);
        }

        let remote = &self.ctx.remote;
        let name = task.key.name.as_str();
        let fetched = self
            .ctx
            .retry
            .execute("get", name, &mut task.attempt, move || remote.get_value(name))
            .await;

        let value = match fetched {
            Ok(value) => value,
            Err(RetryError::Cancelled) => return None,
            Err(e) => {
                if let Some(ErrorClass::AuthFailed(_)) = e.kv_error().map(|k| k.class()) {
                    self.ctx
                        .shutdown
                        .abort(format!("authentication failed while downloading '{name}': {e}"));
                }
                let attempts = task.attempt;
                self.record_failure(task, attempts, e.to_string());
                return Some(Resolution::Failed);
            }
        };

        let destination = task.destination.clone();
        let written =
            tokio::task::spawn_blocking(move || storage::write_value(&destination, &value)).await;
        match written {
            Ok(Ok(bytes)) => {
                self.log_key(&task.key.name, "Downloaded");
                Some(Resolution::Downloaded { bytes })
            }
            Ok(Err(e)) => {
                let attempts = task.attempt;
                self.record_failure(task, attempts, e.to_string());
                Some(Resolution::Failed)
            }
            Err(e) => {
                let attempts = task.attempt;
                self.record_failure(task, attempts, format!("write task failed: {e}"));
                Some(Resolution::Failed)
            }
        }
    }

    fn finish(&self, task: DownloadTask, resolution: Resolution) {
        self.ctx.stats.record(resolution);
        task.resolve(resolution);
    }

    fn claim(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string())
    }

    fn unclaim(&self, key: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    fn record_failure(&self, task: &DownloadTask, attempts: u32, reason: String) {
        warn!(worker = self.id, key = %task.key.name, attempts, reason = %reason, "Key failed");
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(FailedKey {
                key: task.key.name.clone(),
                attempts,
                reason,
            });
    }

    fn log_key(&self, key: &str, message: &str) {
        if self.ctx.config.verbose {
            info!(worker = self.id, key = %key, "{message}");
        } else {
            debug!(worker = self.id, key = %key, "{message}");
        }
    }
}
