//! Remote namespace access
//!
//! The backup pipeline only sees the narrow [`KvNamespace`] interface: list a
//! page of keys from a cursor, and get one value. Every failure is a
//! [`KvError`] whose [`ErrorClass`] decides whether it is worth retrying.

use crate::{Cursor, KeyDescriptor};
use async_trait::async_trait;
use bytes::Bytes;

pub mod cloudflare;

/// Classification of a failed outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Request timed out
    NetworkTimeout,
    /// Connection refused, DNS failure, or other offline scenarios
    NetworkOffline,
    /// HTTP 429 or an explicit rate-limit signal in the body
    RateLimit,
    /// HTTP 5xx
    ServerError(u16),
    /// HTTP 404 or a key that vanished between listing and fetch
    NotFound,
    /// HTTP 401/403
    AuthFailed(u16),
    /// Any other 4xx, or a 3xx that was not followed
    ClientError(u16),
    /// The response arrived but could not be understood
    InvalidResponse,
}

impl ErrorClass {
    /// Short description used in retry and failure messages.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network timeout",
            Self::NetworkOffline => "connection failed",
            Self::RateLimit => "rate limit exceeded",
            Self::ServerError(code) => match code {
                500 => "internal server error",
                502 => "bad gateway",
                503 => "service unavailable",
                504 => "gateway timeout",
                _ => "server error",
            },
            Self::NotFound => "key not found",
            Self::AuthFailed(code) => match code {
                401 => "authentication failed (401)",
                403 => "authentication failed (403)",
                _ => "authentication failed",
            },
            Self::ClientError(_) => "client error",
            Self::InvalidResponse => "invalid response",
        }
    }

    /// Suggested remediation shown alongside permanent failures.
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "Check your network connection and firewall settings",
            Self::NetworkOffline => "Verify internet connectivity and DNS resolution",
            Self::RateLimit => "Lower --max-requests or widen --window-secs",
            Self::ServerError(_) => "The service may be degraded, try again later",
            Self::NotFound => "The key was deleted after it was listed",
            Self::AuthFailed(_) => "Verify the API token and its KV read permission",
            Self::ClientError(_) => "Check the account and namespace identifiers",
            Self::InvalidResponse => "The API returned an unexpected payload",
        }
    }

    /// Whether a call failing this way may succeed when repeated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkTimeout | Self::NetworkOffline | Self::RateLimit | Self::ServerError(_)
        )
    }

    /// Classify an HTTP status code. Returns `None` for success codes.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            401 | 403 => Some(Self::AuthFailed(status)),
            404 => Some(Self::NotFound),
            429 => Some(Self::RateLimit),
            500..=599 => Some(Self::ServerError(status)),
            _ => Some(Self::ClientError(status)),
        }
    }
}

/// Failure of a single outbound call
#[derive(Debug, Clone, thiserror::Error)]
#[error("{} ({message})", .class.description())]
pub struct KvError {
    class: ErrorClass,
    message: String,
}

impl KvError {
    /// Create an error of the given class
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Rate-limited response
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::RateLimit, message)
    }

    /// Key not found
    pub fn not_found(key: &str) -> Self {
        Self::new(ErrorClass::NotFound, format!("key '{key}' does not exist"))
    }

    /// Classification of this failure
    pub fn class(&self) -> ErrorClass {
        self.class
    }

    /// Underlying detail message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the call should be retried
    pub fn is_transient(&self) -> bool {
        self.class.is_transient()
    }
}

/// Result type for remote operations
pub type KvResult<T> = Result<T, KvError>;

/// One response from the listing endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPage {
    /// Keys in this page, in listing order
    pub keys: Vec<KeyDescriptor>,
    /// Where the next page starts, or [`Cursor::End`]
    pub next: Cursor,
}

/// Remote key-value namespace
///
/// Implementations must be safe to call from many tasks at once. Credentials
/// and transport are the implementation's concern.
#[async_trait]
pub trait KvNamespace: Send + Sync {
    /// List one page of keys starting at `cursor`.
    async fn list_keys(&self, cursor: &Cursor) -> KvResult<KeyPage>;

    /// Fetch the raw value stored under `key`.
    async fn get_value(&self, key: &str) -> KvResult<Bytes>;
}
