//! Metadata server HTTP client.
//!
//! Every request is a hanging GET: the server holds it open until the
//! document differs from the revision named by `last_etag`, or until its
//! own `timeout_sec` elapses.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::ETAG;
use tracing::debug;

use crate::error::MetadataError;

/// Default metadata server base URL.
pub const DEFAULT_METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1";

const METADATA_REQUEST_HEADER: &str = "X-Google-Metadata-Request";
const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const NONE_TOKEN: &str = "NONE";

/// Revision marker for the last document seen.
///
/// The sentinel `NONE` makes the server answer immediately.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeToken(String);

impl ChangeToken {
    /// The sentinel token: "state unknown, answer right away".
    pub fn none() -> Self {
        Self(NONE_TOKEN.to_string())
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn is_none(&self) -> bool {
        self.0 == NONE_TOKEN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ChangeToken {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Display for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the metadata server (no trailing slash needed).
    pub base_url: String,

    /// How long the server may hold a request open waiting for a change.
    pub server_timeout: Duration,

    /// Client-side request timeout. Must exceed `server_timeout` so an
    /// abandoned connection is reclaimed instead of hanging forever.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_METADATA_URL.to_string(),
            server_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(70),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

/// A successful poll: the raw body and the token to present next time.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub body: Bytes,
    pub token: ChangeToken,
}

/// Metadata server client.
#[derive(Debug, Clone)]
pub struct MetadataClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl MetadataClient {
    /// Create a new metadata client.
    pub fn new(config: ClientConfig) -> Result<Self, MetadataError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(MetadataError::Client)?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Perform one hanging GET against the server.
    ///
    /// On success the returned token is taken from the response's `ETag`
    /// header, or reset to the sentinel if the header is missing. On
    /// failure the caller must reset its own token to the sentinel.
    pub async fn fetch_once(&self, last: &ChangeToken) -> Result<FetchResponse, MetadataError> {
        let url = format!("{}/", self.config.base_url.trim_end_matches('/'));
        let server_timeout = self.config.server_timeout.as_secs().to_string();

        debug!(url = %url, last_etag = %last, "Waiting for metadata change");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("recursive", "true"),
                ("alt", "json"),
                ("wait_for_change", "true"),
                ("timeout_sec", server_timeout.as_str()),
                ("last_etag", last.as_str()),
            ])
            .header(METADATA_REQUEST_HEADER, "True")
            .header(METADATA_FLAVOR_HEADER, "Google")
            .send()
            .await
            .map_err(MetadataError::Transient)?;

        let status = response.status();
        if !status.is_success() {
            return Err(MetadataError::Status(status.as_u16()));
        }

        let token = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(ChangeToken::new)
            .unwrap_or_else(ChangeToken::none);

        let body = response.bytes().await.map_err(MetadataError::Transient)?;

        debug!(etag = %token, bytes = body.len(), "Metadata response received");

        Ok(FetchResponse { body, token })
    }
}
