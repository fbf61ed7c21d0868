//! On-disk checkpoint format

use kv_backup::resume::checkpoint::SCHEMA_VERSION;
use kv_backup::resume::{Checkpoint, CheckpointStore, ResumeError};
use kv_backup::Cursor;
use tempfile::TempDir;

#[test]
fn test_saved_file_is_readable_json() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path().join("state").join("checkpoint.json"));
    store
        .save(&Checkpoint::new(Cursor::Token("opaque==".into()), 1500, 2))
        .unwrap();

    let contents = std::fs::read_to_string(store.path()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
    assert_eq!(value["schema_version"], SCHEMA_VERSION);
    assert_eq!(value["cursor"]["state"], "token");
    assert_eq!(value["cursor"]["value"], "opaque==");
    assert_eq!(value["keys_processed_in_run"], 1500);
}

#[test]
fn test_save_leaves_no_partial_files() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
    for page in 0..5u64 {
        store
            .save(&Checkpoint::new(Cursor::Token(format!("c{page}")), page, page))
            .unwrap();
    }

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(names, vec!["checkpoint.json".to_string()]);
    assert_eq!(store.load(), Cursor::Token("c4".into()));
}

#[test]
fn test_hand_written_checkpoint_is_accepted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("checkpoint.json");
    std::fs::write(
        &path,
        r#"{"schema_version":"1.0.0","cursor":{"state":"token","value":"abc"},"updated_at":0}"#,
    )
    .unwrap();

    let checkpoint = CheckpointStore::new(&path).load_checkpoint().unwrap().unwrap();
    assert_eq!(checkpoint.cursor(), &Cursor::Token("abc".into()));
    assert_eq!(checkpoint.pages_committed(), 0);
}

#[test]
fn test_future_schema_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("checkpoint.json");
    std::fs::write(
        &path,
        r#"{"schema_version":"9.0.0","cursor":{"state":"start"},"updated_at":0}"#,
    )
    .unwrap();

    let store = CheckpointStore::new(&path);
    assert!(matches!(
        store.load_checkpoint(),
        Err(ResumeError::SchemaVersionMismatch { .. })
    ));
    assert_eq!(store.load(), Cursor::Start);
}
