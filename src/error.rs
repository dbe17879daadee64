//! Error taxonomy for the download/save pipeline.
//!
//! One variant per failure class. Each stage fails fast with its own kind
//! and a human-readable cause; no stage retries internally. All transport
//! failures collapse into `Network` regardless of status code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SaveError {
    /// URL failed pre-flight classification; no network call was made.
    #[error("not a direct media URL: {0}")]
    Validation(String),

    /// Media store access is not granted. Checked before the fetch begins.
    #[error("media store access not granted")]
    Permission,

    /// A download is already in flight on this engine (single-flight).
    /// Caller misuse, never queued.
    #[error("a download is already in flight on this engine")]
    Busy,

    /// Transport-level failure: DNS, TLS, timeout, connection reset, or a
    /// non-2xx status. Carries the underlying cause.
    #[error("network failure: {0}")]
    Network(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Filesystem failure while writing, moving, or cleaning up the payload.
    #[error("storage failure: {0}")]
    Storage(#[from] std::io::Error),

    /// Downloaded bytes could not be read or decoded as the required media
    /// type.
    #[error("unsupported media content: {0}")]
    UnsupportedContent(String),

    /// The media store rejected the commit.
    #[error("media store commit failed: {0}")]
    Persistence(String),

    /// The transfer was aborted through its cancel handle.
    #[error("download cancelled")]
    Cancelled,
}

impl SaveError {
    /// Wraps any transport-level cause as `Network`.
    pub fn network<E>(cause: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        SaveError::Network(cause.into())
    }
}
