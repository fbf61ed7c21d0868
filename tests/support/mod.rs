//! Shared fixtures: a scripted in-memory namespace and config helpers

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use kv_backup::downloader::{BackupConfig, RetryEvent, RetryPolicy};
use kv_backup::remote::{ErrorClass, KeyPage, KvError, KvNamespace, KvResult};
use kv_backup::shutdown::SharedShutdown;
use kv_backup::{Cursor, KeyDescriptor};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Listing tokens handed out for pages after the first
const PAGE_TOKENS: [&str; 8] = ["A", "B", "C", "D", "E", "F", "G", "H"];

struct MockPage {
    keys: Vec<String>,
    next: Cursor,
}

/// In-memory namespace whose failures and delays are scripted per key
pub struct MockNamespace {
    pages: Vec<MockPage>,
    values: HashMap<String, Bytes>,
    scripted_get_failures: Mutex<HashMap<String, VecDeque<KvError>>>,
    permanent_get_failures: HashMap<String, ErrorClass>,
    scripted_list_failures: Mutex<VecDeque<KvError>>,
    get_delay: Duration,
    drain_on_get: Mutex<Option<(String, SharedShutdown)>>,
    get_calls: Mutex<HashMap<String, u32>>,
    list_calls: Mutex<Vec<Cursor>>,
    call_times: Mutex<Vec<Instant>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
}

impl MockNamespace {
    /// Namespace listing `pages` in order; values default to `value-of-<key>`
    pub fn with_pages(pages: &[&[&str]]) -> Self {
        let mut mock_pages = Vec::new();
        let mut values = HashMap::new();
        for (index, keys) in pages.iter().enumerate() {
            let next = if index + 1 < pages.len() {
                Cursor::Token(PAGE_TOKENS[index].to_string())
            } else {
                Cursor::End
            };
            for key in keys.iter() {
                values.insert(key.to_string(), Bytes::from(format!("value-of-{key}")));
            }
            mock_pages.push(MockPage {
                keys: keys.iter().map(|k| k.to_string()).collect(),
                next,
            });
        }

        Self {
            pages: mock_pages,
            values,
            scripted_get_failures: Mutex::new(HashMap::new()),
            permanent_get_failures: HashMap::new(),
            scripted_list_failures: Mutex::new(VecDeque::new()),
            get_delay: Duration::ZERO,
            drain_on_get: Mutex::new(None),
            get_calls: Mutex::new(HashMap::new()),
            list_calls: Mutex::new(Vec::new()),
            call_times: Mutex::new(Vec::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Override one value
    pub fn value(mut self, key: &str, value: &[u8]) -> Self {
        self.values
            .insert(key.to_string(), Bytes::copy_from_slice(value));
        self
    }

    /// Fail the next gets of `key` with these errors, then succeed
    pub fn fail_get(self, key: &str, errors: Vec<KvError>) -> Self {
        self.scripted_get_failures
            .lock()
            .unwrap()
            .insert(key.to_string(), errors.into());
        self
    }

    /// Fail every get of `key` with `class`
    pub fn always_fail_get(mut self, key: &str, class: ErrorClass) -> Self {
        self.permanent_get_failures.insert(key.to_string(), class);
        self
    }

    /// Fail the next listing calls with these errors
    pub fn fail_list(self, errors: Vec<KvError>) -> Self {
        *self.scripted_list_failures.lock().unwrap() = errors.into();
        self
    }

    /// Every get takes this long
    pub fn get_delay(mut self, delay: Duration) -> Self {
        self.get_delay = delay;
        self
    }

    /// Request a drain from inside the first get of `key`
    pub fn drain_on_get(self, key: &str, shutdown: SharedShutdown) -> Self {
        *self.drain_on_get.lock().unwrap() = Some((key.to_string(), shutdown));
        self
    }

    /// Gets issued for `key`
    pub fn get_calls(&self, key: &str) -> u32 {
        self.get_calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Gets issued for any key
    pub fn total_get_calls(&self) -> u32 {
        self.get_calls.lock().unwrap().values().sum()
    }

    /// Cursors passed to listing calls, in order
    pub fn list_calls(&self) -> Vec<Cursor> {
        self.list_calls.lock().unwrap().clone()
    }

    /// Start instants of every outbound call
    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }

    /// Calls currently executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of calls seen executing at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlightGuard {
        self.call_times.lock().unwrap().push(Instant::now());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self.in_flight.clone())
    }

    fn page_index(&self, cursor: &Cursor) -> KvResult<usize> {
        match cursor {
            Cursor::Start => Ok(0),
            Cursor::Token(token) => PAGE_TOKENS
                .iter()
                .position(|t| t == token)
                .map(|i| i + 1)
                .filter(|i| *i < self.pages.len())
                .ok_or_else(|| {
                    KvError::new(ErrorClass::ClientError(400), format!("unknown cursor {token}"))
                }),
            Cursor::End => Err(KvError::new(
                ErrorClass::ClientError(400),
                "listing past the end",
            )),
        }
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvNamespace for MockNamespace {
    async fn list_keys(&self, cursor: &Cursor) -> KvResult<KeyPage> {
        let _guard = self.enter();
        self.list_calls.lock().unwrap().push(cursor.clone());

        if let Some(err) = self.scripted_list_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if self.pages.is_empty() {
            return Ok(KeyPage {
                keys: Vec::new(),
                next: Cursor::End,
            });
        }

        let page = &self.pages[self.page_index(cursor)?];
        Ok(KeyPage {
            keys: page.keys.iter().map(KeyDescriptor::new).collect(),
            next: page.next.clone(),
        })
    }

    async fn get_value(&self, key: &str) -> KvResult<Bytes> {
        let _guard = self.enter();
        *self
            .get_calls
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_insert(0) += 1;

        let trigger = {
            let mut slot = self.drain_on_get.lock().unwrap();
            if matches!(slot.as_ref(), Some((target, _)) if target == key) {
                slot.take().map(|(_, shutdown)| shutdown)
            } else {
                None
            }
        };
        if let Some(shutdown) = trigger {
            shutdown.request_shutdown();
        }

        if !self.get_delay.is_zero() {
            tokio::time::sleep(self.get_delay).await;
        }

        let scripted = self
            .scripted_get_failures
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(|queue| queue.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }
        if let Some(class) = self.permanent_get_failures.get(key) {
            return Err(KvError::new(*class, format!("scripted failure for {key}")));
        }

        self.values
            .get(key)
            .cloned()
            .ok_or_else(|| KvError::not_found(key))
    }
}

/// Retry policy with small deterministic delays
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(400),
        jitter: false,
    }
}

/// Config rooted in `dir` with a generous rate limit
pub fn test_config(dir: &Path, workers: usize) -> kv_backup::downloader::BackupConfigBuilder {
    BackupConfig::builder(dir.join("data"))
        .checkpoint_path(dir.join("checkpoint.json"))
        .workers(workers)
        .page_size(10)
        .rate_limit(10_000, Duration::from_secs(1))
        .retry(fast_retry(3))
        .progress_interval(Duration::from_secs(3600))
}

/// Collects retry events for later assertions
#[derive(Clone, Default)]
pub struct RetryLog(Arc<Mutex<Vec<RetryEvent>>>);

impl RetryLog {
    /// Observer to hand to the executor
    pub fn observer(&self) -> kv_backup::downloader::retry::RetryObserver {
        let events = self.0.clone();
        Arc::new(move |event: &RetryEvent| events.lock().unwrap().push(event.clone()))
    }

    /// Events recorded so far
    pub fn events(&self) -> Vec<RetryEvent> {
        self.0.lock().unwrap().clone()
    }
}
