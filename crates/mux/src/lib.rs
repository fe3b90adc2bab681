//! `dash-mux`: live fragmented-MP4 segment muxer.
//!
//! Builds independently decodable DASH segments from an H.264 video source
//! and an optional AAC/AMR audio source (ISO Base Media File Format /
//! ISO 14496-12, fragmented).
//!
//! # Architecture
//!
//! - **In-memory boxes**: segments are assembled in a growable buffer and
//!   forward references are patched in place before the buffer is released
//! - **One thread per track**: each track pulls from its source until end
//!   of segment; the muxer waits for all of them before serializing
//! - **Patchable segments**: a private `Xmta` record inside a `free` box
//!   indexes the fields a client rewrites when stitching segments
//!
//! # Usage
//!
//! ```ignore
//! use dash_mux::{SegmentMuxer, StartParams};
//! use dash_common::MuxerConfig;
//!
//! let mut muxer = SegmentMuxer::new(MuxerConfig::default());
//! muxer.init(video_source, Some(audio_source), false)?;
//! muxer.start(&StartParams::default())?;
//! muxer.wait_for_eos();
//! muxer.stop()?;
//! let segment = muxer.take_output();
//! ```

pub mod atoms;
pub mod avc;
pub mod error;
pub mod esds;
pub mod inspect;
pub mod mp4;
pub mod muxer;
pub mod track;
pub mod xmta;

// Re-export primary API types
pub use atoms::{BoxWriter, Stash};
pub use avc::AvcConfig;
pub use error::{MuxError, MuxResult};
pub use muxer::{SegmentMuxer, StartParams};
pub use track::{CodecSpecificData, Track, TrackEvent};
pub use xmta::{patch, SegmentIndex, SegmentPatch};
