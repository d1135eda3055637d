//! Per-frame dispatch: de-duplication, rate division, validation and
//! timestamping before frames reach the processor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::{debug, info, warn};

use crate::lifecycle::Lifecycle;
use crate::processor::FrameSink;
use crate::ports::Timestamp;
use crate::timesync::{self, apply_offset, TimestampSync};
use crate::traits::{Format, FrameListener, FrameSample, GrabberError, Result};

/// Native backend ticks per second (backends report seconds).
const NATIVE_TICKS_PER_SECOND: f64 = 1.0;

#[derive(Debug)]
struct DispatchState {
    /// Bit pattern of the previous native timestamp.
    last_native_time: Option<u64>,
    frames_seen: u64,
    syncer: TimestampSync,
}

/// The listener registered with the capture backend.
///
/// Frames are only forwarded once the dispatcher is armed with the
/// negotiated format. Every rejected frame is dropped with a log line; the
/// backend never sees an error.
#[derive(Debug)]
pub struct FrameDispatcher<S> {
    sink: S,
    lifecycle: Arc<Lifecycle>,
    divisor: u64,
    time_offset_ms: i64,
    armed: OnceLock<Format>,
    state: Mutex<DispatchState>,
    forwarded: AtomicU64,
    clock: fn() -> Timestamp,
}

impl<S: FrameSink> FrameDispatcher<S> {
    /// Create an unarmed dispatcher forwarding every `divisor`-th frame to
    /// `sink`, shifted by `time_offset_ms`.
    pub fn new(sink: S, lifecycle: Arc<Lifecycle>, divisor: u32, time_offset_ms: i64) -> Self {
        Self {
            sink,
            lifecycle,
            divisor: u64::from(divisor.max(1)),
            time_offset_ms,
            armed: OnceLock::new(),
            state: Mutex::new(DispatchState {
                last_native_time: None,
                frames_seen: 0,
                syncer: TimestampSync::new(NATIVE_TICKS_PER_SECOND),
            }),
            forwarded: AtomicU64::new(0),
            clock: timesync::now,
        }
    }

    /// Read local time from `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> Timestamp) -> Self {
        self.clock = clock;
        self
    }

    /// Arm with the negotiated format. Only the first call has an effect.
    pub fn arm(&self, format: Format) {
        if self.armed.set(format).is_err() {
            warn!("dispatcher already armed, ignoring new format");
        } else {
            info!(
                width = format.width,
                height = format.height,
                pixel_format = %format.pixel_format,
                "dispatcher armed"
            );
        }
    }

    /// Whether a negotiated format is known.
    pub fn is_armed(&self) -> bool {
        self.armed.get().is_some()
    }

    /// Frames that passed the duplicate and running filters.
    pub fn frames_seen(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frames_seen
    }

    /// Frames handed to the sink.
    pub fn frames_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Drop the native-to-local offset estimate so the next frame
    /// re-establishes it. Called whenever capture (re)starts.
    pub fn resync(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .syncer
            .reset();
    }

    /// The sink frames are forwarded to.
    pub const fn sink(&self) -> &S {
        &self.sink
    }

    /// Decide whether `sample` is forwarded, and with which timestamp.
    /// `Ok(None)` is a silent skip, `Err` a rejected frame.
    fn admit(&self, sample: &FrameSample<'_>) -> Result<Option<u64>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let native_bits = sample.native_time.to_bits();
        if state.last_native_time == Some(native_bits) {
            return Err(GrabberError::FrameValidation(format!(
                "duplicate frame at native time {}",
                sample.native_time
            )));
        }
        state.last_native_time = Some(native_bits);

        if !self.lifecycle.is_running() {
            return Ok(None);
        }

        let index = state.frames_seen;
        state.frames_seen += 1;
        if index % self.divisor != 0 {
            return Ok(None);
        }

        let format = self.armed.get().ok_or_else(|| {
            GrabberError::FrameValidation("frame arrived before format negotiation".to_owned())
        })?;

        let required = format.min_buffer_len().ok_or_else(|| {
            GrabberError::FrameValidation(format!(
                "negotiated format {} has no fixed pixel size",
                format.pixel_format
            ))
        })?;
        if sample.data.len() < required {
            return Err(GrabberError::FrameValidation(format!(
                "invalid sample size: {} bytes, need {required}",
                sample.data.len()
            )));
        }

        let local = state.syncer.convert_at(sample.native_time, (self.clock)());
        Ok(Some(apply_offset(local, self.time_offset_ms)))
    }
}

impl<S: FrameSink> FrameListener for FrameDispatcher<S> {
    fn on_frame(&self, sample: &FrameSample<'_>) {
        match self.admit(sample) {
            Ok(Some(timestamp)) => {
                let Some(format) = self.armed.get().copied() else {
                    return;
                };
                let sample = FrameSample {
                    format: Format {
                        origin: sample.format.origin,
                        stride: sample.format.stride.max(format.stride),
                        ..format
                    },
                    ..*sample
                };
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                self.sink.handle_frame(timestamp, &sample);
            }
            Ok(None) => {}
            Err(err) => debug!(%err, "frame dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleState;
    use crate::ports::Timestamp;
    use crate::traits::PixelFormat;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<(Timestamp, f64)>>,
    }

    impl FrameSink for Recorder {
        fn handle_frame(&self, timestamp: Timestamp, sample: &FrameSample<'_>) {
            self.frames
                .lock()
                .expect("recorder lock")
                .push((timestamp, sample.native_time));
        }
    }

    impl Recorder {
        fn native_times(&self) -> Vec<f64> {
            self.frames
                .lock()
                .expect("recorder lock")
                .iter()
                .map(|(_, native)| *native)
                .collect()
        }
    }

    const FORMAT: Format = Format::new(4, 2, PixelFormat::Bgr24);

    fn dispatcher(divisor: u32, offset_ms: i64) -> FrameDispatcher<Recorder> {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.set(LifecycleState::Running);
        let dispatcher = FrameDispatcher::new(Recorder::default(), lifecycle, divisor, offset_ms);
        dispatcher.arm(FORMAT);
        dispatcher
    }

    fn deliver(dispatcher: &FrameDispatcher<Recorder>, native_time: f64, len: usize) {
        let data = vec![0u8; len];
        dispatcher.on_frame(&FrameSample {
            data: &data,
            native_time,
            format: FORMAT,
        });
    }

    const FULL: usize = 4 * 2 * 3;

    #[test]
    fn test_divisor_one_forwards_all() {
        let dispatcher = dispatcher(1, 0);
        for i in 0..5 {
            deliver(&dispatcher, f64::from(i), FULL);
        }
        assert_eq!(dispatcher.sink().native_times(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_divisor_forwards_every_nth() {
        let dispatcher = dispatcher(3, 0);
        for i in 0..7 {
            deliver(&dispatcher, f64::from(i), FULL);
        }
        assert_eq!(dispatcher.sink().native_times(), vec![0.0, 3.0, 6.0]);
        assert_eq!(dispatcher.frames_seen(), 7);
        assert_eq!(dispatcher.frames_forwarded(), 3);
    }

    #[test]
    fn test_duplicate_timestamp_counted_once() {
        let dispatcher = dispatcher(1, 0);
        deliver(&dispatcher, 1.0, FULL);
        deliver(&dispatcher, 1.0, FULL);
        deliver(&dispatcher, 2.0, FULL);

        assert_eq!(dispatcher.frames_seen(), 2);
        assert_eq!(dispatcher.sink().native_times(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_duplicates_do_not_advance_divisor() {
        let dispatcher = dispatcher(2, 0);
        deliver(&dispatcher, 1.0, FULL);
        deliver(&dispatcher, 1.0, FULL);
        deliver(&dispatcher, 2.0, FULL);
        deliver(&dispatcher, 3.0, FULL);

        assert_eq!(dispatcher.sink().native_times(), vec![1.0, 3.0]);
    }

    #[test]
    fn test_not_running_discards_without_counting() {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.set(LifecycleState::Initializing);
        let dispatcher =
            FrameDispatcher::new(Recorder::default(), Arc::clone(&lifecycle), 1, 0);
        dispatcher.arm(FORMAT);

        deliver(&dispatcher, 1.0, FULL);
        assert_eq!(dispatcher.frames_seen(), 0);

        lifecycle.set(LifecycleState::Running);
        deliver(&dispatcher, 2.0, FULL);
        assert_eq!(dispatcher.sink().native_times(), vec![2.0]);
    }

    #[test]
    fn test_undersized_buffer_never_forwarded() {
        let dispatcher = dispatcher(1, 0);
        deliver(&dispatcher, 1.0, FULL - 1);
        deliver(&dispatcher, 2.0, 0);
        deliver(&dispatcher, 3.0, FULL + 8);

        assert_eq!(dispatcher.sink().native_times(), vec![3.0]);
        assert_eq!(dispatcher.frames_seen(), 3);
    }

    #[test]
    fn test_unarmed_drops() {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.set(LifecycleState::Running);
        let dispatcher = FrameDispatcher::new(Recorder::default(), lifecycle, 1, 0);

        deliver(&dispatcher, 1.0, FULL);
        assert!(!dispatcher.is_armed());
        assert!(dispatcher.sink().native_times().is_empty());
    }

    const SECOND: Timestamp = 1_000_000_000;

    fn fixed_clock() -> Timestamp {
        100 * SECOND
    }

    impl Recorder {
        fn timestamps(&self) -> Vec<Timestamp> {
            self.frames
                .lock()
                .expect("recorder lock")
                .iter()
                .map(|(timestamp, _)| *timestamp)
                .collect()
        }
    }

    #[test]
    fn test_time_offset_applied() {
        let plain = dispatcher(1, 0).with_clock(fixed_clock);
        let shifted = dispatcher(1, 250).with_clock(fixed_clock);
        deliver(&plain, 10.0, FULL);
        deliver(&shifted, 10.0, FULL);

        assert_eq!(plain.sink().timestamps(), vec![100 * SECOND]);
        assert_eq!(shifted.sink().timestamps(), vec![100 * SECOND + 250_000_000]);
    }

    static RESYNC_NOW: AtomicU64 = AtomicU64::new(0);

    fn resync_clock() -> Timestamp {
        RESYNC_NOW.load(Ordering::SeqCst)
    }

    #[test]
    fn test_resync_restarts_offset() {
        let dispatcher = dispatcher(1, 0).with_clock(resync_clock);
        RESYNC_NOW.store(100 * SECOND, Ordering::SeqCst);
        deliver(&dispatcher, 10.0, FULL);

        dispatcher.resync();
        // 400ms more latency than before: without the resync this would only
        // be nudged into the estimate.
        RESYNC_NOW.store(100 * SECOND + 500_000_000, Ordering::SeqCst);
        deliver(&dispatcher, 10.1, FULL);

        assert_eq!(
            dispatcher.sink().timestamps(),
            vec![100 * SECOND, 100 * SECOND + 500_000_000]
        );
    }
}
