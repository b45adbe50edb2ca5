//! Error types for metadata fetching.

use thiserror::Error;

/// Errors from talking to the metadata server.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The request never produced a usable response (connect, timeout, body read).
    #[error("metadata request failed: {0}")]
    Transient(#[source] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("metadata server returned status {0}")]
    Status(u16),

    /// The response body is not a valid metadata document.
    #[error("malformed metadata document: {0}")]
    Parse(#[source] serde_json::Error),

    /// The HTTP client could not be constructed.
    #[error("failed to build metadata client: {0}")]
    Client(#[source] reqwest::Error),
}

impl MetadataError {
    /// Returns true if the failure happened on the network path and the
    /// request should be retried after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Status(_))
    }

    /// Returns true if the response arrived but could not be parsed.
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse(_))
    }
}
