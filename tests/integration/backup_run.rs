//! End-to-end backup runs against the in-memory namespace

use crate::support::{test_config, MockNamespace, RetryLog};
use kv_backup::downloader::{BackupExecutor, DownloadError};
use kv_backup::remote::{ErrorClass, KvError};
use kv_backup::resume::{CheckpointStore, ResumeError, RunLock};
use kv_backup::shutdown::ShutdownCoordinator;
use kv_backup::storage::destination_path;
use kv_backup::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn executor(dir: &TempDir, remote: Arc<MockNamespace>, workers: usize) -> BackupExecutor {
    let config = test_config(dir.path(), workers).build().unwrap();
    BackupExecutor::new(Arc::new(config), remote, ShutdownCoordinator::shared())
}

fn read_checkpoint(dir: &TempDir) -> serde_json::Value {
    let contents = std::fs::read_to_string(dir.path().join("checkpoint.json")).unwrap();
    serde_json::from_str(&contents).unwrap()
}

#[tokio::test]
async fn test_two_pages_with_one_transient_failure() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(
        MockNamespace::with_pages(&[&["k1", "k2"], &["k3"]])
            .fail_get("k2", vec![KvError::rate_limited("HTTP 429")]),
    );
    let log = RetryLog::default();
    let executor = executor(&dir, remote.clone(), 2).with_retry_observer(log.observer());

    let summary = executor.execute().await.unwrap();

    assert_eq!(summary.downloaded, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.carried_over, 0);
    assert_eq!(summary.pages_committed, 2);
    assert_eq!(summary.retries, 1);
    assert_eq!(summary.final_cursor, Cursor::End);
    assert!(summary.is_complete());

    let data = dir.path().join("data");
    for key in ["k1", "k2", "k3"] {
        let contents = std::fs::read(destination_path(&data, key)).unwrap();
        assert_eq!(contents, format!("value-of-{key}").into_bytes());
    }

    let checkpoint = read_checkpoint(&dir);
    assert_eq!(checkpoint["cursor"]["state"], "end");
    assert_eq!(checkpoint["pages_committed"], 2);

    let events = log.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].target, "k2");
    assert_eq!(events[0].class, ErrorClass::RateLimit);
    assert_eq!(remote.get_calls("k2"), 2);
    assert_eq!(remote.list_calls(), vec![Cursor::Start, Cursor::Token("A".into())]);
}

#[tokio::test]
async fn test_existing_destination_is_skipped() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(destination_path(&data, "x"), b"local copy").unwrap();

    let remote = Arc::new(MockNamespace::with_pages(&[&["x", "y"]]));
    let summary = executor(&dir, remote.clone(), 2).execute().await.unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.downloaded, 1);
    assert_eq!(remote.get_calls("x"), 0);
    assert_eq!(
        std::fs::read(destination_path(&data, "x")).unwrap(),
        b"local copy"
    );
}

#[tokio::test]
async fn test_force_overwrite_refetches_existing_values() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(destination_path(&data, "x"), b"stale").unwrap();

    let remote = Arc::new(MockNamespace::with_pages(&[&["x"]]).value("x", b"fresh"));
    let config = test_config(dir.path(), 1)
        .force_overwrite(true)
        .build()
        .unwrap();
    let summary = BackupExecutor::new(Arc::new(config), remote.clone(), ShutdownCoordinator::shared())
        .execute()
        .await
        .unwrap();

    assert_eq!(summary.downloaded, 1);
    assert_eq!(remote.get_calls("x"), 1);
    assert_eq!(std::fs::read(destination_path(&data, "x")).unwrap(), b"fresh");
}

#[tokio::test]
async fn test_repeat_run_fetches_nothing() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MockNamespace::with_pages(&[&["a", "b"], &["c"]]));

    let first = executor(&dir, remote.clone(), 2).execute().await.unwrap();
    assert_eq!(first.downloaded, 3);
    let gets_after_first = remote.total_get_calls();

    // The completed checkpoint sends the second run back to the start
    let second = executor(&dir, remote.clone(), 2).execute().await.unwrap();
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.skipped, 3);
    assert_eq!(remote.total_get_calls(), gets_after_first);
    assert_eq!(remote.list_calls().iter().filter(|c| **c == Cursor::Start).count(), 2);
}

#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_verbose_key_failure_is_logged_as_warning() {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let dir = TempDir::new().unwrap();
    let remote = Arc::new(
        MockNamespace::with_pages(&[&["gone"]]).always_fail_get("gone", ErrorClass::NotFound),
    );
    let config = test_config(dir.path(), 1).verbose(true).build().unwrap();
    let summary = BackupExecutor::new(Arc::new(config), remote, ShutdownCoordinator::shared())
        .execute()
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);

    let logs = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
    let line = logs
        .lines()
        .find(|l| l.contains("Key failed"))
        .expect("no key failure logged");
    assert!(line.contains("WARN"), "{line}");
    assert!(line.contains("worker="), "{line}");
    assert!(!logs.contains("ERROR"), "{logs}");
}

#[tokio::test]
async fn test_missing_key_fails_without_retry() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(
        MockNamespace::with_pages(&[&["gone", "kept"]]).always_fail_get("gone", ErrorClass::NotFound),
    );

    let summary = executor(&dir, remote.clone(), 2).execute().await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.downloaded, 1);
    assert_eq!(remote.get_calls("gone"), 1);
    assert_eq!(summary.failed_keys[0].key, "gone");
    assert_eq!(summary.failed_keys[0].attempts, 1);
    // A failed key still resolves its page
    assert_eq!(summary.final_cursor, Cursor::End);
    assert!(!destination_path(&dir.path().join("data"), "gone").exists());
}

#[tokio::test]
async fn test_empty_namespace_completes() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MockNamespace::with_pages(&[]));

    let summary = executor(&dir, remote, 2).execute().await.unwrap();

    assert_eq!(summary.downloaded, 0);
    assert_eq!(summary.pages_committed, 1);
    assert!(summary.is_complete());
    assert_eq!(read_checkpoint(&dir)["cursor"]["state"], "end");
}

#[tokio::test]
async fn test_awkward_key_names_are_stored_safely() {
    let dir = TempDir::new().unwrap();
    let long = "k".repeat(400);
    let keys = ["users/42", ".hidden", "a b?c", long.as_str()];
    let remote = Arc::new(MockNamespace::with_pages(&[&keys]));

    let summary = executor(&dir, remote, 2).execute().await.unwrap();
    assert_eq!(summary.downloaded, 4);

    let data = dir.path().join("data");
    let mut entries: Vec<String> = std::fs::read_dir(&data)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    entries.sort();
    assert_eq!(entries.len(), 4);
    assert!(entries.contains(&"users%2F42".to_string()));
    assert!(entries.contains(&"%2Ehidden".to_string()));
    assert!(entries.contains(&"a%20b%3Fc".to_string()));
    assert!(entries.iter().all(|e| e.len() <= 240));
}

#[tokio::test]
async fn test_locked_checkpoint_is_rejected() {
    let dir = TempDir::new().unwrap();
    let checkpoint = dir.path().join("checkpoint.json");
    let _held = RunLock::try_acquire(&checkpoint).unwrap();

    let remote = Arc::new(MockNamespace::with_pages(&[&["a"]]));
    let result = executor(&dir, remote.clone(), 1).execute().await;

    assert!(matches!(
        result,
        Err(DownloadError::Resume(ResumeError::Locked(_)))
    ));
    assert!(remote.list_calls().is_empty());
}

#[tokio::test]
async fn test_unwritable_destination_fails_before_listing() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("data"), b"not a directory").unwrap();

    let remote = Arc::new(MockNamespace::with_pages(&[&["a"]]));
    let result = executor(&dir, remote.clone(), 1).execute().await;

    assert!(matches!(result, Err(DownloadError::Storage(_))));
    assert!(remote.list_calls().is_empty());
    assert_eq!(
        CheckpointStore::new(dir.path().join("checkpoint.json")).load(),
        Cursor::Start
    );
}

#[tokio::test]
async fn test_duplicate_key_in_listing_fetched_once() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(
        MockNamespace::with_pages(&[&["dup", "dup"]]).get_delay(Duration::from_millis(200)),
    );
    // Overwriting is forced so only the in-flight guard can stop a second fetch
    let config = test_config(dir.path(), 2)
        .force_overwrite(true)
        .build()
        .unwrap();
    let summary = BackupExecutor::new(Arc::new(config), remote.clone(), ShutdownCoordinator::shared())
        .execute()
        .await
        .unwrap();

    assert_eq!(remote.get_calls("dup"), 1);
    assert_eq!(summary.downloaded, 1);
    assert_eq!(summary.skipped, 1);
    assert!(summary.is_complete());
    assert_eq!(
        std::fs::read(destination_path(&dir.path().join("data"), "dup")).unwrap(),
        b"value-of-dup"
    );
}

#[tokio::test]
async fn test_checkpoint_write_failure_does_not_stop_run() {
    let dir = TempDir::new().unwrap();
    // A non-empty directory where the checkpoint file belongs
    let checkpoint = dir.path().join("checkpoint.json");
    std::fs::create_dir(&checkpoint).unwrap();
    std::fs::write(checkpoint.join("occupied"), b"x").unwrap();

    let remote = Arc::new(MockNamespace::with_pages(&[&["k1", "k2"], &["k3"]]));
    let summary = executor(&dir, remote.clone(), 2).execute().await.unwrap();

    assert_eq!(summary.downloaded, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.final_cursor, Cursor::End);
    assert_eq!(remote.list_calls(), vec![Cursor::Start, Cursor::Token("A".into())]);
    let data = dir.path().join("data");
    for key in ["k1", "k2", "k3"] {
        assert!(destination_path(&data, key).exists(), "{key}");
    }
    assert!(checkpoint.is_dir());
}
