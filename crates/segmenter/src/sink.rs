//! Channel-backed segment sink.
//!
//! The segmentation thread must never block on a slow consumer, so a full
//! channel drops the segment instead of waiting.

use crossbeam::channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use dash_common::{Segment, SegmentSink};

/// Delivers segments over a crossbeam channel.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: Sender<Segment>,
}

impl ChannelSink {
    /// A sink holding at most `capacity` undelivered segments.
    pub fn bounded(capacity: usize) -> (Self, Receiver<Segment>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx }, rx)
    }

    pub fn unbounded() -> (Self, Receiver<Segment>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl SegmentSink for ChannelSink {
    fn send(&self, segment: Segment) {
        match self.tx.try_send(segment) {
            Ok(()) => {}
            Err(TrySendError::Full(segment)) => {
                warn!(
                    duration_ms = segment.duration_ms,
                    bytes = segment.data.len(),
                    "Segment consumer is behind, dropping segment"
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Segment consumer disconnected");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dash_common::SegmentTag;
    use std::time::SystemTime;

    fn segment(duration_ms: i64) -> Segment {
        Segment {
            tag: SegmentTag::Video,
            when: SystemTime::now(),
            duration_ms,
            data: vec![0; 16],
        }
    }

    #[test]
    fn delivers_in_order() {
        let (sink, rx) = ChannelSink::unbounded();
        sink.send(segment(1000));
        sink.send(segment(2000));
        assert_eq!(rx.try_recv().unwrap().duration_ms, 1000);
        assert_eq!(rx.try_recv().unwrap().duration_ms, 2000);
    }

    #[test]
    fn full_channel_drops_newest() {
        let (sink, rx) = ChannelSink::bounded(1);
        sink.send(segment(1000));
        sink.send(segment(2000));
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.try_recv().unwrap().duration_ms, 1000);
    }

    #[test]
    fn disconnected_consumer_is_ignored() {
        let (sink, rx) = ChannelSink::bounded(1);
        drop(rx);
        sink.send(segment(1000));
    }
}
