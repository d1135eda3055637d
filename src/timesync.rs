//! Mapping of backend timestamps onto the local measurement timeline.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::ports::Timestamp;

/// Number of samples over which a positive offset error is worked off.
const DRIFT_CORRECTION_DIVISOR: i128 = 100;

/// Latency increase, in nanoseconds, beyond which the native clock is taken
/// to have stalled (for example while the graph was paused) and the offset
/// is re-established from the current sample.
const MAX_LATENCY_STEP: i128 = 1_000_000_000;

const NANOS_PER_SECOND: f64 = 1e9;

/// Current local time in nanoseconds since the Unix epoch.
pub fn now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
        })
}

/// Translates native backend time into local time.
///
/// Keeps a running estimate of the offset between the two clocks. A sample
/// that arrives with less latency than the current estimate pulls the offset
/// down at once; a larger latency only nudges it up by a fraction, so
/// scheduling jitter does not leak into the timestamps while slow clock drift
/// is still followed. A latency jump of more than a second means the native
/// clock stood still, and the estimate restarts from that sample.
#[derive(Debug, Clone)]
pub struct TimestampSync {
    ticks_per_second: f64,
    offset: Option<i128>,
}

impl TimestampSync {
    /// Create a synchronizer for a native clock ticking `ticks_per_second`
    /// times per second.
    #[must_use]
    pub const fn new(ticks_per_second: f64) -> Self {
        Self {
            ticks_per_second,
            offset: None,
        }
    }

    /// Convert `native` to local time, observed now.
    pub fn convert_native_to_local(&mut self, native: f64) -> Timestamp {
        self.convert_at(native, now())
    }

    /// Convert `native` to local time, observed at `local`.
    pub fn convert_at(&mut self, native: f64, local: Timestamp) -> Timestamp {
        #[allow(clippy::cast_possible_truncation)]
        let native_ns = (native / self.ticks_per_second * NANOS_PER_SECOND).round() as i128;
        let observed = i128::from(local) - native_ns;

        let offset = match self.offset {
            Some(current) if observed - current > MAX_LATENCY_STEP => {
                debug!(
                    step_ms = i64::try_from((observed - current) / 1_000_000).unwrap_or(i64::MAX),
                    "native clock stalled, resynchronizing"
                );
                observed
            }
            Some(current) if observed >= current => {
                current + (observed - current) / DRIFT_CORRECTION_DIVISOR
            }
            _ => observed,
        };
        self.offset = Some(offset);

        u64::try_from(native_ns + offset).unwrap_or(0)
    }

    /// Forget the offset estimate; the next sample defines a new one.
    pub fn reset(&mut self) {
        self.offset = None;
    }

    /// Current offset estimate in nanoseconds (local minus native).
    pub const fn offset(&self) -> Option<i128> {
        self.offset
    }
}

/// Shift `timestamp` by `offset_ms` milliseconds, saturating at the ends of
/// the timeline.
pub const fn apply_offset(timestamp: Timestamp, offset_ms: i64) -> Timestamp {
    timestamp.saturating_add_signed(offset_ms.saturating_mul(1_000_000))
}
