//! Upstream encoder interface.

use crate::error::SourceResult;
use crate::format::SourceFormat;
use crate::sample::Sample;

/// Parameters handed to a source when a track starts pulling from it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStartParams {
    /// Producer-clock time at which the consumer wants samples to begin.
    pub start_time_us: i64,
}

/// A producer of encoded samples.
///
/// `read` may block for as long as the encoder needs. `stop` may be called
/// from another thread while a `read` is in flight and must make that read
/// return eventually.
pub trait SampleSource: Send + Sync {
    fn format(&self) -> SourceFormat;

    fn start(&self, params: &SourceStartParams) -> SourceResult<()>;

    fn stop(&self) -> SourceResult<()>;

    /// Next sample, or `Err(SourceError::EndOfStream)` once exhausted.
    fn read(&self) -> SourceResult<Sample>;
}
