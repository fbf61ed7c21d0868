//! Cloudflare Workers KV client
//!
//! Implements [`KvNamespace`] over the Cloudflare v4 REST API:
//! - `GET /accounts/{account}/storage/kv/namespaces/{ns}/keys?limit=&cursor=`
//! - `GET /accounts/{account}/storage/kv/namespaces/{ns}/values/{key}`
//!
//! Rate limiting and retries are not handled here; the backup pipeline wraps
//! every call in its own admission gate and retry controller.

use bytes::Bytes;
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{ErrorClass, KeyPage, KvError, KvNamespace, KvResult};
use crate::{Cursor, KeyDescriptor};

/// Production API root
pub const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Largest page the listing endpoint accepts
pub const MAX_PAGE_SIZE: usize = 1000;

/// HTTP connect timeout (seconds) - time to establish TCP connection
const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
/// HTTP request timeout (seconds) - values can be up to 25 MiB
const HTTP_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Credentials and identifiers for one namespace
#[derive(Clone)]
pub struct CloudflareCredentials {
    api_token: String,
    account_id: String,
    namespace_id: String,
}

impl CloudflareCredentials {
    /// Create credentials for a namespace
    pub fn new(
        api_token: impl Into<String>,
        account_id: impl Into<String>,
        namespace_id: impl Into<String>,
    ) -> Self {
        Self {
            api_token: api_token.into(),
            account_id: account_id.into(),
            namespace_id: namespace_id.into(),
        }
    }
}

impl std::fmt::Debug for CloudflareCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareCredentials")
            .field("api_token", &"<redacted>")
            .field("account_id", &self.account_id)
            .field("namespace_id", &self.namespace_id)
            .finish()
    }
}

/// Cloudflare KV namespace client
pub struct CloudflareKvClient {
    client: Client,
    base_url: Url,
    credentials: CloudflareCredentials,
    page_size: usize,
}

impl CloudflareKvClient {
    /// Create a client against the production API
    pub fn new(credentials: CloudflareCredentials) -> KvResult<Self> {
        Self::with_base_url(credentials, DEFAULT_API_BASE)
    }

    /// Create a client against an alternative API root (used by tests)
    pub fn with_base_url(credentials: CloudflareCredentials, base_url: &str) -> KvResult<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/')).map_err(|e| {
            KvError::new(ErrorClass::ClientError(0), format!("invalid API base URL: {e}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(KvError::new(
                ErrorClass::ClientError(0),
                format!("API base URL cannot carry a path: {base_url}"),
            ));
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| classify_transport_error(&e))?;

        Ok(Self {
            client,
            base_url,
            credentials,
            page_size: MAX_PAGE_SIZE,
        })
    }

    /// Set how many keys each listing request asks for (clamped to 1..=1000)
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Configured page size
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn namespace_url(&self, tail: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        {
            // cannot_be_a_base was rejected in the constructor
            if let Ok(mut segments) = url.path_segments_mut() {
                segments
                    .pop_if_empty()
                    .extend([
                        "accounts",
                        self.credentials.account_id.as_str(),
                        "storage",
                        "kv",
                        "namespaces",
                        self.credentials.namespace_id.as_str(),
                    ])
                    .extend(tail.iter().copied());
            }
        }
        url
    }

    /// URL of the listing endpoint for a cursor
    pub fn keys_url(&self, cursor: &Cursor) -> Url {
        let mut url = self.namespace_url(&["keys"]);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &self.page_size.to_string());
            if let Some(token) = cursor.token() {
                query.append_pair("cursor", token);
            }
        }
        url
    }

    /// URL of the value endpoint; the key is escaped as a single path segment
    pub fn value_url(&self, key: &str) -> Url {
        self.namespace_url(&["values", key])
    }

    async fn send(&self, url: Url) -> KvResult<Response> {
        debug!(url = %url, "Sending KV API request");
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.credentials.api_token)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        match ErrorClass::from_status(status.as_u16()) {
            None => Ok(response),
            Some(class) => {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                Err(KvError::new(class, format!("HTTP {status}: {}", api_error_detail(&body))))
            }
        }
    }
}

#[async_trait::async_trait]
impl KvNamespace for CloudflareKvClient {
    async fn list_keys(&self, cursor: &Cursor) -> KvResult<KeyPage> {
        let response = self.send(self.keys_url(cursor)).await?;
        // A body cut short in transit is a transport failure, not a bad payload
        let raw = response
            .bytes()
            .await
            .map_err(|e| classify_transport_error(&e))?;
        let body: ListKeysResponse = serde_json::from_slice(&raw).map_err(|e| {
            KvError::new(ErrorClass::InvalidResponse, format!("failed to decode key listing: {e}"))
        })?;

        if !body.success {
            return Err(KvError::new(
                ErrorClass::InvalidResponse,
                format!("listing reported failure: {}", join_api_errors(&body.errors)),
            ));
        }

        let keys = body
            .result
            .into_iter()
            .map(|item| KeyDescriptor {
                name: item.name,
                size_hint: None,
            })
            .collect::<Vec<_>>();
        let next = Cursor::from_remote(body.result_info.and_then(|info| info.cursor));

        debug!(keys = keys.len(), next = %next, "Listed page of keys");
        Ok(KeyPage { keys, next })
    }

    async fn get_value(&self, key: &str) -> KvResult<Bytes> {
        let response = match self.send(self.value_url(key)).await {
            Err(e) if e.class() == ErrorClass::NotFound => return Err(KvError::not_found(key)),
            other => other?,
        };
        response
            .bytes()
            .await
            .map_err(|e| classify_transport_error(&e))
    }
}

/// Map a transport-level reqwest error to a failure class.
pub fn classify_transport_error(err: &reqwest::Error) -> KvError {
    let class = if err.is_timeout() {
        ErrorClass::NetworkTimeout
    } else if err.is_decode() {
        ErrorClass::InvalidResponse
    } else if err.is_builder() {
        ErrorClass::ClientError(0)
    } else {
        ErrorClass::NetworkOffline
    };
    KvError::new(class, err.to_string())
}

#[derive(Debug, Deserialize)]
struct ListKeysResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    #[serde(default)]
    result: Vec<ListedKey>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ListedKey {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<ApiMessage>,
}

fn join_api_errors(errors: &[ApiMessage]) -> String {
    if errors.is_empty() {
        return "no error details".to_string();
    }
    errors
        .iter()
        .map(|e| format!("[{}] {}", e.code, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

fn api_error_detail(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) if !envelope.errors.is_empty() => join_api_errors(&envelope.errors),
        _ => body.chars().take(200).collect(),
    }
}
