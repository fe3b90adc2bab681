//! Segmentation loop error types.

use dash_mux::MuxError;
use thiserror::Error;

/// Errors that prevent the segmentation loop from running.
///
/// Per-segment failures never surface here; the loop logs them and moves
/// on to the next segment.
#[derive(Debug, Error)]
pub enum SegmenterError {
    #[error("Failed to spawn segmenter thread: {0}")]
    Spawn(String),

    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error(transparent)]
    Mux(#[from] MuxError),
}
