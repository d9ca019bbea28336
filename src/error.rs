//! Error types for the page cache and its transport.

use thiserror::Error;

/// Result type alias for page cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Failure of a single manifest or payload fetch.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Server answered with a non-success status.
    #[error("HTTP {code} for {locator}")]
    Status { locator: String, code: u16 },

    /// Connection, DNS or timeout failure.
    #[error("network error for {locator}: {message}")]
    Network { locator: String, message: String },

    /// Body could not be read or parsed.
    #[error("could not decode {locator}: {message}")]
    Decode { locator: String, message: String },

    /// The blocking fetch task died before answering.
    #[error("fetch task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    /// Caller asked for a page the manifest does not have. This is a bug in
    /// the caller (page count mismatch), not a runtime condition.
    #[error("We have a problem: page {num} is not in a thread of {len} pages")]
    NoSuchPage { num: usize, len: usize },

    /// No manifest has been loaded yet.
    #[error("no thread manifest loaded")]
    NoManifest,

    #[error("manifest {locator} failed: {error}")]
    Manifest { locator: String, error: String },

    #[error("page {num} failed to load: {error}")]
    PageFailed { num: usize, error: String },

    /// The thread was switched while waiting for one of its pages.
    #[error("thread changed while waiting for page {num}")]
    Superseded { num: usize },

    #[error("page cache closed")]
    Closed,
}
