//! Checkpoint record persisted after each committed page

use serde::{Deserialize, Serialize};

use crate::Cursor;

/// Current checkpoint schema version
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Durable record of listing progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    schema_version: String,
    cursor: Cursor,
    #[serde(default)]
    keys_processed_in_run: u64,
    #[serde(default)]
    pages_committed: u64,
    updated_at: i64,
}

impl Checkpoint {
    /// Create a checkpoint stamped with the current time
    pub fn new(cursor: Cursor, keys_processed_in_run: u64, pages_committed: u64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            cursor,
            keys_processed_in_run,
            pages_committed,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Cursor to resume listing from
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// Keys resolved by the run that wrote this checkpoint
    pub fn keys_processed_in_run(&self) -> u64 {
        self.keys_processed_in_run
    }

    /// Pages committed by the run that wrote this checkpoint
    pub fn pages_committed(&self) -> u64 {
        self.pages_committed
    }

    /// Write time in Unix milliseconds
    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    /// Schema version found in the file
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// Whether the listing had been walked to the end
    pub fn is_complete(&self) -> bool {
        self.cursor.is_end()
    }
}
