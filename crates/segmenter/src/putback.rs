//! One-sample lookahead over a live encoder.
//!
//! The sample that ends a segment is pushed back and read again as the
//! first sample of the next one. The wrapper outlives individual segments,
//! so it also carries codec configuration that only appears once at the
//! start of the encoder's stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use dash_common::{
    FormatCodecData, Sample, SampleSource, SourceError, SourceFormat, SourceResult,
    SourceStartParams,
};

/// A source with a put-back stack in front of it.
pub struct PutBackSource {
    inner: Arc<dyn SampleSource>,
    /// Read back last-in first-out.
    stash: Mutex<Vec<Sample>>,
    codec_data: Mutex<Option<FormatCodecData>>,
    started: AtomicBool,
    stopped: AtomicBool,
    exhausted: AtomicBool,
}

impl PutBackSource {
    pub fn new(inner: Arc<dyn SampleSource>) -> Self {
        Self {
            inner,
            stash: Mutex::new(Vec::new()),
            codec_data: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
        }
    }

    /// Make `sample` the next one `read` returns.
    pub fn put_back(&self, sample: Sample) {
        trace!(pts_us = sample.pts_us, "Putting back sample");
        self.stash.lock().push(sample);
    }

    /// Report `data` in `format` from now on.
    pub fn set_codec_data(&self, data: FormatCodecData) {
        *self.codec_data.lock() = Some(data);
    }

    pub fn stashed(&self) -> usize {
        self.stash.lock().len()
    }

    /// Whether the upstream source has reported end of stream.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }
}

impl SampleSource for PutBackSource {
    fn format(&self) -> SourceFormat {
        let mut format = self.inner.format();
        if let Some(data) = self.codec_data.lock().clone() {
            format.codec_data = Some(data);
        }
        format
    }

    /// Starts the upstream source on first use only; later segments keep
    /// reading the same live stream.
    fn start(&self, params: &SourceStartParams) -> SourceResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(SourceError::Stopped);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.start(params).inspect_err(|_| {
            self.started.store(false, Ordering::Release);
        })
    }

    /// Stops the upstream source for good. Only the first call is forwarded.
    fn stop(&self) -> SourceResult<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.stop()
    }

    fn read(&self) -> SourceResult<Sample> {
        if let Some(sample) = self.stash.lock().pop() {
            return Ok(sample);
        }
        let result = self.inner.read();
        if matches!(result, Err(SourceError::EndOfStream)) {
            self.exhausted.store(true, Ordering::Release);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dash_common::{AudioCodec, SourceFormat};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        starts: AtomicUsize,
        samples: Mutex<VecDeque<Sample>>,
    }

    impl SampleSource for Counting {
        fn format(&self) -> SourceFormat {
            SourceFormat::audio(AudioCodec::Aac, 48_000, 2)
        }

        fn start(&self, _params: &SourceStartParams) -> SourceResult<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) -> SourceResult<()> {
            Ok(())
        }

        fn read(&self) -> SourceResult<Sample> {
            self.samples
                .lock()
                .pop_front()
                .ok_or(SourceError::EndOfStream)
        }
    }

    fn counting(pts: &[i64]) -> Arc<Counting> {
        Arc::new(Counting {
            starts: AtomicUsize::new(0),
            samples: Mutex::new(pts.iter().map(|&t| Sample::new(vec![1], t)).collect()),
        })
    }

    #[test]
    fn put_back_sample_is_read_first() {
        let inner = counting(&[0, 10, 20]);
        let source = PutBackSource::new(inner);
        let first = source.read().unwrap();
        assert_eq!(first.pts_us, 0);
        let second = source.read().unwrap();
        source.put_back(second);
        assert_eq!(source.stashed(), 1);
        assert_eq!(source.read().unwrap().pts_us, 10);
        assert_eq!(source.read().unwrap().pts_us, 20);
    }

    #[test]
    fn stash_is_last_in_first_out() {
        let source = PutBackSource::new(counting(&[]));
        source.put_back(Sample::new(vec![1], 1));
        source.put_back(Sample::new(vec![2], 2));
        assert_eq!(source.read().unwrap().pts_us, 2);
        assert_eq!(source.read().unwrap().pts_us, 1);
    }

    #[test]
    fn upstream_is_started_once() {
        let inner = counting(&[]);
        let source = PutBackSource::new(inner.clone());
        let params = SourceStartParams::default();
        source.start(&params).unwrap();
        source.start(&params).unwrap();
        assert_eq!(inner.starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stopped_source_is_not_restarted() {
        let inner = counting(&[]);
        let source = PutBackSource::new(inner.clone());
        source.stop().unwrap();
        source.stop().unwrap();
        assert!(matches!(
            source.start(&SourceStartParams::default()),
            Err(SourceError::Stopped)
        ));
        assert_eq!(inner.starts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn codec_data_overrides_format() {
        let source = PutBackSource::new(counting(&[]));
        assert_eq!(source.format().codec_data, None);
        source.set_codec_data(FormatCodecData::Esds(vec![3, 4]));
        assert_eq!(
            source.format().codec_data,
            Some(FormatCodecData::Esds(vec![3, 4]))
        );
    }

    #[test]
    fn end_of_stream_marks_exhausted() {
        let source = PutBackSource::new(counting(&[5]));
        source.read().unwrap();
        assert!(!source.is_exhausted());
        assert!(source.read().unwrap_err().is_end_of_stream());
        assert!(source.is_exhausted());
    }
}
