//! `dash-common`: shared types, traits, and errors for the DASH segment muxer.
//!
//! - **Samples**: `Sample` (one encoded access unit, moved from producer to track)
//! - **Sources**: `SampleSource`, `SourceFormat`, `MediaKind` (upstream encoder boundary)
//! - **Segments**: `Segment`, `SegmentSink` (downstream boundary)
//! - **Types**: `TimeScale`, `Rotation`
//! - **Errors**: `SourceError` (thiserror-based)
//! - **Config**: `MuxerConfig`, `SegmenterConfig`

pub mod codec;
pub mod config;
pub mod error;
pub mod format;
pub mod sample;
pub mod segment;
pub mod source;
pub mod types;

// Re-export commonly used items at crate root
pub use codec::{AudioCodec, VideoCodec};
pub use config::{HeaderMode, MuxerConfig, NalLengthSize, SegmenterConfig};
pub use error::{SourceError, SourceResult};
pub use format::{FormatCodecData, MediaKind, SourceFormat};
pub use sample::Sample;
pub use segment::{Segment, SegmentSink, SegmentTag};
pub use source::{SampleSource, SourceStartParams};
pub use types::{Rotation, TimeScale};
