//! Error types for the wire crate.

use thiserror::Error;

/// Failure of a single logical HTTP request (all attempts included).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The server answered 410. Never retried.
    #[error("{method} {url} returned 410 Gone")]
    Gone { method: String, url: String },

    #[error("{method} {url} failed after {attempts} attempts")]
    Exhausted {
        method: String,
        url: String,
        attempts: u32,
    },

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

impl TransportError {
    pub fn is_gone(&self) -> bool {
        matches!(self, TransportError::Gone { .. })
    }
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("unable to read blob type: {0}")]
    BlobTypeUnavailable(#[source] TransportError),

    #[error("unknown blob type: {}", .0.as_deref().unwrap_or("<missing>"))]
    UnknownBlobType(Option<String>),

    #[error("{stage} failed: {source}")]
    Transport {
        stage: &'static str,
        #[source]
        source: TransportError,
    },
}
