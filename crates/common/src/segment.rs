//! Finished segments and the downstream sink interface.

use std::time::SystemTime;

/// Logical stream a segment belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SegmentTag {
    Video,
}

/// A fully patched fragmented-MP4 segment.
#[derive(Clone, Debug)]
pub struct Segment {
    pub tag: SegmentTag,
    /// Wall-clock time the segment started recording.
    pub when: SystemTime,
    /// Nominal duration (video track).
    pub duration_ms: i64,
    pub data: Vec<u8>,
}

/// Consumer of finished segments.
///
/// `send` takes ownership of the segment and must not block the caller for
/// long; dropping under backpressure is the sink's decision.
pub trait SegmentSink: Send + Sync {
    fn send(&self, segment: Segment);
}
