//! Error types shared across the sink.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the buffering and upload pipeline
#[derive(Error, Debug)]
pub enum SinkError {
    /// The local disk refused a write. Buffering guarantees are void once this
    /// happens, so callers must treat it as fatal for the whole sink.
    #[error("Local write failed for {path}: {source}")]
    LocalWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A writer was used after it had been closed
    #[error("Writer for {0} is already closed")]
    AlreadyClosed(PathBuf),

    /// An upload exhausted its retries or was rejected by the remote store
    #[error("Upload of {path} failed after {attempts} attempt(s): {message}")]
    UploadTerminal {
        path: PathBuf,
        attempts: u32,
        message: String,
    },

    #[error("Upload queue is closed")]
    UploadQueueClosed,

    /// Returned by every call after a fatal error stopped the sink
    #[error("Sink halted after fatal error: {0}")]
    Halted(String),

    #[error("Failed to deserialize message: {0}")]
    Deserialize(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SinkError {
    pub(crate) fn local_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SinkError::LocalWrite {
            path: path.into(),
            source,
        }
    }

    /// Whether the error means the sink can no longer guarantee buffered data
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SinkError::LocalWrite { .. }
                | SinkError::AlreadyClosed(_)
                | SinkError::UploadQueueClosed
                | SinkError::Halted(_)
        )
    }
}

/// Errors returned by an [`ObjectStore`](crate::store::ObjectStore) backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Network failure, timeout or throttling. Worth another attempt.
    #[error("Retryable storage error: {0}")]
    Retryable(String),

    /// Rejected by the remote store (auth, malformed key, ...). Retrying will not help.
    #[error("Terminal storage error: {0}")]
    Terminal(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Retryable(_))
    }
}

pub type Result<T, E = SinkError> = std::result::Result<T, E>;
