//! Upstream source error types (thiserror-based).

use thiserror::Error;

/// Errors reported by a [`SampleSource`](crate::source::SampleSource).
#[derive(Error, Debug)]
pub enum SourceError {
    /// No more samples. Consumers treat this as a clean finish.
    #[error("End of stream")]
    EndOfStream,

    /// The source was stopped while a read was pending.
    #[error("Source stopped")]
    Stopped,

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}

/// Convenience Result type for source operations.
pub type SourceResult<T> = Result<T, SourceError>;
