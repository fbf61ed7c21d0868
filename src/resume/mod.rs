//! Resume capability for backup runs
//!
//! Provides the checkpoint record, its atomic persistence and the run lock.

pub mod checkpoint;
pub mod lock;
pub mod state;

pub use checkpoint::Checkpoint;
pub use lock::RunLock;
pub use state::{CheckpointStore, ResumeError};
