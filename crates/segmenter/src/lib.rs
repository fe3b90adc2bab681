//! `dash-segmenter`: key-frame aligned segmentation of live encoder output.
//!
//! Wraps a live H.264 encoder and an optional audio encoder, and drives one
//! `SegmentMuxer` per segment:
//!
//! - **Video** ends each segment just before the next key frame, which is
//!   put back and opens the following segment
//! - **Audio** is paced by video progress and ends once it covers the
//!   video boundary
//! - **Delivery** goes through a `SegmentSink`; `ChannelSink` is the
//!   crossbeam-backed default
//!
//! # Usage
//!
//! ```ignore
//! use dash_segmenter::{ChannelSink, SegmentationLoop};
//! use dash_common::SegmenterConfig;
//!
//! let (sink, segments) = ChannelSink::bounded(8);
//! let segmenter = SegmentationLoop::new(
//!     SegmenterConfig::default(),
//!     video_encoder,
//!     Some(audio_encoder),
//!     Arc::new(sink),
//! )?;
//! let mut handle = segmenter.spawn()?;
//! for segment in segments.iter().take(10) {
//!     upload(segment);
//! }
//! handle.shutdown();
//! ```

pub mod audio;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod putback;
pub mod sink;
pub mod video;

pub use audio::AudioSegmenter;
pub use error::SegmenterError;
pub use pipeline::{SegmentationLoop, SegmenterHandle};
pub use progress::{Progress, ProgressKind, ProgressWait, VideoProgress};
pub use putback::PutBackSource;
pub use sink::ChannelSink;
pub use video::VideoSegmenter;
