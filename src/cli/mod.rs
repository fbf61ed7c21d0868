//! CLI command implementations

pub mod backup;
pub mod error;

pub use backup::{Cli, OutputFormat};
pub use error::CliError;

use crate::downloader::RunSummary;

/// Process exit status for a finished run
pub const EXIT_SUCCESS: i32 = 0;
/// Structural failure
pub const EXIT_FAILURE: i32 = 1;
/// Strict mode with failed keys
pub const EXIT_KEYS_FAILED: i32 = 2;
/// Interrupted by a termination request
pub const EXIT_INTERRUPTED: i32 = 130;

/// Exit status for a run outcome
pub fn exit_code(result: &Result<RunSummary, CliError>, strict: bool) -> i32 {
    match result {
        Ok(summary) if summary.interrupted => EXIT_INTERRUPTED,
        Ok(summary) if strict && summary.failed > 0 => EXIT_KEYS_FAILED,
        Ok(_) => EXIT_SUCCESS,
        Err(e) if e.is_interruption() => EXIT_INTERRUPTED,
        Err(_) => EXIT_FAILURE,
    }
}
