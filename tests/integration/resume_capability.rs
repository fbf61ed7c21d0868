//! Interrupted runs resume from the last fully resolved page

use crate::support::{test_config, MockNamespace};
use kv_backup::downloader::BackupExecutor;
use kv_backup::resume::{Checkpoint, CheckpointStore};
use kv_backup::shutdown::ShutdownCoordinator;
use kv_backup::storage::destination_path;
use kv_backup::Cursor;
use std::sync::Arc;
use tempfile::TempDir;

const PAGES: &[&[&str]] = &[&["a", "b"], &["c", "d"], &["e"]];

#[tokio::test]
async fn test_drained_run_resumes_without_refetching() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    let store = CheckpointStore::new(dir.path().join("checkpoint.json"));

    // First run: a drain arrives while "c" is being fetched
    let shutdown = ShutdownCoordinator::shared();
    let remote = Arc::new(MockNamespace::with_pages(PAGES).drain_on_get("c", shutdown.clone()));
    let config = Arc::new(test_config(dir.path(), 1).queue_capacity(1).build().unwrap());

    let first = BackupExecutor::new(config.clone(), remote.clone(), shutdown)
        .execute()
        .await
        .unwrap();

    assert!(first.interrupted);
    assert_eq!(first.downloaded, 3);
    assert!(first.carried_over >= 1);
    assert_eq!(first.final_cursor, Cursor::Token("A".into()));
    assert_eq!(store.load(), Cursor::Token("A".into()));
    for key in ["a", "b", "c"] {
        assert!(destination_path(&data, key).exists(), "{key}");
    }
    assert!(!destination_path(&data, "d").exists());

    // Second run picks up at the checkpointed page
    let second = BackupExecutor::new(config, remote.clone(), ShutdownCoordinator::shared())
        .execute()
        .await
        .unwrap();

    assert!(!second.interrupted);
    assert!(second.is_complete());
    assert_eq!(second.skipped, 1);
    assert_eq!(second.downloaded, 2);
    for key in ["a", "b", "c", "d", "e"] {
        assert!(destination_path(&data, key).exists(), "{key}");
        assert_eq!(remote.get_calls(key), 1, "{key}");
    }

    let listed = remote.list_calls();
    assert_eq!(listed.iter().filter(|c| **c == Cursor::Start).count(), 1);
    assert_eq!(listed.last(), Some(&Cursor::Token("B".into())));
    assert!(store.load_checkpoint().unwrap().unwrap().is_complete());
}

#[tokio::test]
async fn test_resume_from_saved_token() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
    store
        .save(&Checkpoint::new(Cursor::Token("B".into()), 4, 2))
        .unwrap();

    let remote = Arc::new(MockNamespace::with_pages(PAGES));
    let config = test_config(dir.path(), 2).build().unwrap();
    let summary = BackupExecutor::new(Arc::new(config), remote.clone(), ShutdownCoordinator::shared())
        .execute()
        .await
        .unwrap();

    assert_eq!(remote.list_calls(), vec![Cursor::Token("B".into())]);
    assert_eq!(summary.downloaded, 1);
    assert_eq!(remote.get_calls("e"), 1);
    assert_eq!(remote.get_calls("a"), 0);
}

#[tokio::test]
async fn test_legacy_plain_cursor_file_is_honoured() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("checkpoint.json"), "A\n").unwrap();

    let remote = Arc::new(MockNamespace::with_pages(PAGES));
    let config = test_config(dir.path(), 2).build().unwrap();
    let summary = BackupExecutor::new(Arc::new(config), remote.clone(), ShutdownCoordinator::shared())
        .execute()
        .await
        .unwrap();

    assert_eq!(remote.list_calls()[0], Cursor::Token("A".into()));
    assert_eq!(summary.downloaded, 3);

    // Rewritten in the current format
    let contents = std::fs::read_to_string(dir.path().join("checkpoint.json")).unwrap();
    assert!(contents.contains("\"schema_version\""));
}

#[tokio::test]
async fn test_corrupt_checkpoint_restarts_from_beginning() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("checkpoint.json"), "{ not json").unwrap();

    let remote = Arc::new(MockNamespace::with_pages(PAGES));
    let config = test_config(dir.path(), 2).build().unwrap();
    let summary = BackupExecutor::new(Arc::new(config), remote.clone(), ShutdownCoordinator::shared())
        .execute()
        .await
        .unwrap();

    assert_eq!(remote.list_calls()[0], Cursor::Start);
    assert_eq!(summary.downloaded, 5);
    assert!(summary.is_complete());
}

#[tokio::test]
async fn test_reset_discards_progress() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
    store
        .save(&Checkpoint::new(Cursor::Token("B".into()), 4, 2))
        .unwrap();

    assert!(store.reset().unwrap());
    assert!(!store.reset().unwrap());
    assert_eq!(store.load(), Cursor::Start);
}
