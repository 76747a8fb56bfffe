//! Error types for the ocsf-parser-check crate.

use std::path::PathBuf;

/// Errors that can occur while discovering, scoring, or live-validating
/// generator/parser pairs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A generator or parser artifact could not be read or loaded.
    #[error("cannot load artifact {path}: {reason}")]
    Discovery { path: PathBuf, reason: String },

    /// A parser configuration is malformed.
    #[error("malformed parser configuration: {0}")]
    Extraction(String),

    /// The ingestion endpoint rejected a batch or was unreachable.
    #[error("submission failed: {0}")]
    Submission(String),

    /// A query attempt failed in a way that is worth retrying.
    #[error("transient query failure: {reason}")]
    TransientQuery { reason: String, rate_limited: bool },

    /// A query attempt failed in a way that retrying cannot fix.
    #[error("query rejected: {0}")]
    FatalQuery(String),

    /// Failed to write a report or result file.
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to read a file from disk.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// JSON parse error with context.
    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid validator configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// HTTP transport error outside the ingestion/query paths.
    #[error("http error: {0}")]
    Http(String),
}

impl Error {
    /// Whether a query error should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientQuery { .. })
    }

    /// Whether the endpoint signalled throttling.
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            Error::TransientQuery {
                rate_limited: true,
                ..
            }
        )
    }
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
