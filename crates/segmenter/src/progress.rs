//! Video progress shared with the audio segmenter.
//!
//! Progress times are producer-clock timestamps of video frames read so
//! far, so they underestimate the end of the video segment. The one
//! exception is `EndOfSegment`, which carries the exact boundary.

use parking_lot::{Condvar, Mutex};
use tracing::trace;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ProgressKind {
    #[default]
    None,
    /// The segment's opening key frame.
    KeyFrame,
    Frame,
    /// The next key frame was seen; its time is the segment boundary.
    EndOfSegment,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub time_us: i64,
    pub kind: ProgressKind,
}

impl Progress {
    pub fn is_end_of_segment(&self) -> bool {
        self.kind == ProgressKind::EndOfSegment
    }
}

/// Outcome of `VideoProgress::wait_until`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProgressWait {
    Reached(Progress),
    Cancelled,
}

#[derive(Debug, Default)]
struct ProgressState {
    latest: Progress,
    cancelled: bool,
}

/// Latest video progress of one segment, with wake-ups for waiters.
#[derive(Debug, Default)]
pub struct VideoProgress {
    state: Mutex<ProgressState>,
    changed: Condvar,
}

impl VideoProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self, time_us: i64, kind: ProgressKind) {
        trace!(time_us, ?kind, "Video progress");
        let mut state = self.state.lock();
        state.latest = Progress { time_us, kind };
        self.changed.notify_all();
    }

    /// Release all waiters; the segment is being torn down.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        self.changed.notify_all();
    }

    pub fn latest(&self) -> Progress {
        self.state.lock().latest
    }

    /// Block until video progress reaches `time_us` or the segment ends.
    pub fn wait_until(&self, time_us: i64) -> ProgressWait {
        let mut state = self.state.lock();
        loop {
            if state.cancelled {
                return ProgressWait::Cancelled;
            }
            if state.latest.time_us >= time_us || state.latest.is_end_of_segment() {
                return ProgressWait::Reached(state.latest);
            }
            self.changed.wait(&mut state);
        }
    }
}
