//! Muxer error types.

use dash_common::SourceError;
use thiserror::Error;

/// Errors that can occur while building a segment.
#[derive(Error, Debug)]
pub enum MuxError {
    /// Bad or inconsistent codec data, or timestamps that go backwards.
    #[error("Malformed input: {0}")]
    Malformed(String),

    /// Codec, stream kind or rotation the segment writer cannot represent.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// API misuse (starting twice, initializing twice).
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Upstream encoder failure other than end of stream.
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// I/O error while writing boxes.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// A track worker thread could not be spawned or panicked.
    #[error("Track worker error: {0}")]
    Worker(String),
}

impl MuxError {
    /// Whether a fresh segment can be attempted after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Malformed(_) | Self::Source(_) | Self::IoError(_) | Self::Worker(_)
        )
    }
}

/// Convenience Result type for mux operations.
pub type MuxResult<T> = Result<T, MuxError>;
