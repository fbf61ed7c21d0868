//! Deterministic destination paths for keys
//!
//! Every key maps to one file directly under the destination root:
//!
//! - bytes outside `[a-z0-9._-]` become `%XX` (uppercase hex), so `/`
//!   never creates directories and `%` itself is always escaped;
//! - uppercase ASCII letters are escaped too, so `User` and `user` stay
//!   distinct on case-insensitive filesystems;
//! - a leading `.` becomes `%2E`, so `.`/`..` are impossible and no key
//!   file ever starts with `.` (temp files do);
//! - encodings longer than [`MAX_ENCODED_LEN`] are shortened to the first
//!   [`HASHED_PREFIX_LEN`] encoded bytes, `~`, and the SHA-256 of the key.
//!   `~` is always escaped in the plain form, so the two forms never collide.
//!
//! # Usage Example
//!
//! ```rust
//! use kv_backup::storage::destination_path;
//! use std::path::Path;
//!
//! let path = destination_path(Path::new("data"), "users/42");
//! assert_eq!(path, Path::new("data/users%2F42"));
//!
//! let path = destination_path(Path::new("data"), "User");
//! assert_eq!(path, Path::new("data/%55ser"));
//! ```

use sha2::{Digest, Sha256};
use std::fmt::Write;
use std::path::{Path, PathBuf};

/// Longest file name kept in plain encoded form
pub const MAX_ENCODED_LEN: usize = 240;

/// Encoded bytes kept in front of the hash for long names
pub const HASHED_PREFIX_LEN: usize = 160;

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_lowercase() || byte.is_ascii_digit() || matches!(byte, b'.' | b'_' | b'-')
}

/// File name for a key
pub fn encode_key_name(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for (i, &byte) in key.as_bytes().iter().enumerate() {
        if is_unreserved(byte) && !(i == 0 && byte == b'.') {
            encoded.push(byte as char);
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }

    if encoded.len() <= MAX_ENCODED_LEN {
        return encoded;
    }

    // Encoded form is pure ASCII, any byte offset is a char boundary
    let mut shortened = encoded[..HASHED_PREFIX_LEN].to_string();
    shortened.push('~');
    for byte in Sha256::digest(key.as_bytes()) {
        let _ = write!(shortened, "{byte:02x}");
    }
    shortened
}

/// Path of the file holding `key` under `root`
pub fn destination_path(root: &Path, key: &str) -> PathBuf {
    root.join(encode_key_name(key))
}
