//! Frame sampling policy.
//!
//! [`FrameSampler`] decides, frame by frame, whether a decoded frame is kept.
//! It keeps the first frame at or after the window start, then each frame at
//! least `interval - SAMPLING_TOLERANCE` seconds after the previously kept
//! one, and ends the run at the first frame past the window end.
//!
//! # Example
//!
//! ```
//! use stillcut::{ExtractionConfig, FrameSampler, SampleDecision};
//!
//! let mut sampler = FrameSampler::new(&ExtractionConfig::new(1.0).with_window(10.0, 12.0));
//! assert_eq!(sampler.decide(9_960_000), SampleDecision::BeforeWindow);
//! assert_eq!(sampler.decide(10_000_000), SampleDecision::Keep);
//! assert_eq!(sampler.decide(10_500_000), SampleDecision::TooSoon);
//! assert_eq!(sampler.decide(10_960_000), SampleDecision::Keep);
//! assert_eq!(sampler.decide(12_040_000), SampleDecision::PastWindow);
//! ```

use crate::configuration::ExtractionConfig;

/// Slack, in seconds, allowed when comparing a frame against the next
/// sampling point.
pub const SAMPLING_TOLERANCE: f64 = 0.05;

/// What to do with one decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleDecision {
    /// Encode and store the frame.
    Keep,
    /// The frame precedes the window start. Release it.
    BeforeWindow,
    /// Too close to the previously kept frame. Release it.
    TooSoon,
    /// The frame is past the window end. Release it and stop the run.
    PastWindow,
}

/// Stateful sampling policy for one run.
///
/// Decisions must be made in timestamp order from a single task;
/// `last_saved` is updated as part of [`decide`](Self::decide), before the
/// kept frame is encoded or stored.
#[derive(Debug, Clone)]
pub struct FrameSampler {
    interval: f64,
    start_time: f64,
    end_time: Option<f64>,
    last_saved: Option<f64>,
}

impl FrameSampler {
    /// Create a sampler for `config`.
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            interval: config.interval,
            start_time: config.start_time,
            end_time: config.has_end().then_some(config.end_time),
            last_saved: None,
        }
    }

    /// Decide the fate of a frame with presentation timestamp
    /// `timestamp_micros`.
    pub fn decide(&mut self, timestamp_micros: i64) -> SampleDecision {
        let seconds = timestamp_micros as f64 / 1_000_000.0;

        if self.end_time.is_some_and(|end| seconds > end) {
            return SampleDecision::PastWindow;
        }
        if seconds < self.start_time {
            return SampleDecision::BeforeWindow;
        }
        let due = match self.last_saved {
            None => true,
            Some(last) => seconds >= last + self.interval - SAMPLING_TOLERANCE,
        };
        if due {
            self.last_saved = Some(seconds);
            SampleDecision::Keep
        } else {
            SampleDecision::TooSoon
        }
    }

    /// Timestamp of the last kept frame, in seconds.
    pub fn last_saved(&self) -> Option<f64> {
        self.last_saved
    }
}

/// Estimate how many frames a run will keep from a video of
/// `duration_seconds`.
///
/// Returns `floor((min(end, duration) - start) / interval) + 1`, or `0` when
/// the duration is unknown or the window starts after the video ends.
pub fn estimate_kept_frames(duration_seconds: f64, config: &ExtractionConfig) -> u64 {
    if !duration_seconds.is_finite() || duration_seconds <= 0.0 || config.interval <= 0.0 {
        return 0;
    }
    let end = if config.has_end() {
        config.end_time.min(duration_seconds)
    } else {
        duration_seconds
    };
    let span = end - config.start_time;
    if span < 0.0 {
        return 0;
    }
    (span / config.interval).floor() as u64 + 1
}
