//! Backpressure between pipeline stages.
//!
//! The [`Coordinator`] is the only component that pauses or resumes a
//! stage. Stages report what they did (`samples_buffered`,
//! `sample_submitted`, `sample_decoded`) and await permission before doing
//! more (`reading_allowed`, `decoder_capacity`, `acquire_slot`). All counters
//! live in one [`watch`] channel, so every waiter re-checks its condition
//! after each change.
//!
//! Reading pauses when more than `high_watermark` samples are buffered or
//! the decoder queue exceeds its limit, and resumes only once buffered
//! samples fall below `low_watermark` and the decoder has room again.

use std::sync::Arc;

use tokio::sync::watch;

use crate::configuration::PipelineLimits;

/// A snapshot of queue depths across the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pressure {
    /// Samples demuxed but not yet handed to the decoder.
    pub pending_samples: usize,
    /// Samples handed to the decoder but not yet decoded.
    pub decode_queue: usize,
    /// Decoded frames holding a processing slot.
    pub frames_in_flight: usize,
    /// Whether the reader is currently held back.
    pub reading_paused: bool,
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    high_watermark: usize,
    low_watermark: usize,
    max_decode_queue: usize,
    max_frames_in_flight: usize,
}

impl Thresholds {
    fn reevaluate(&self, pressure: &mut Pressure) {
        if !pressure.reading_paused
            && (pressure.pending_samples > self.high_watermark
                || pressure.decode_queue > self.max_decode_queue)
        {
            pressure.reading_paused = true;
            log::debug!(
                "Pausing reads: {} samples buffered, decoder queue {}",
                pressure.pending_samples,
                pressure.decode_queue
            );
        } else if pressure.reading_paused
            && pressure.pending_samples < self.low_watermark
            && pressure.decode_queue < self.max_decode_queue
        {
            pressure.reading_paused = false;
            log::debug!(
                "Resuming reads: {} samples buffered, decoder queue {}",
                pressure.pending_samples,
                pressure.decode_queue
            );
        }
    }
}

/// Shared scheduler for one extraction run. Clones share state.
#[derive(Clone)]
pub struct Coordinator {
    state: Arc<watch::Sender<Pressure>>,
    thresholds: Thresholds,
}

impl Coordinator {
    /// Create a coordinator enforcing `limits`.
    ///
    /// Zero limits are raised to one and `low_watermark` is capped at
    /// `high_watermark`, so a hand-built [`PipelineLimits`] cannot stall the
    /// run.
    pub fn new(limits: &PipelineLimits) -> Self {
        let (state, _) = watch::channel(Pressure::default());
        let high_watermark = limits.high_watermark.max(1);
        Self {
            state: Arc::new(state),
            thresholds: Thresholds {
                high_watermark,
                low_watermark: limits.low_watermark.clamp(1, high_watermark),
                max_decode_queue: limits.max_decode_queue.max(1),
                max_frames_in_flight: limits.max_frames_in_flight.max(1),
            },
        }
    }

    fn update(&self, change: impl FnOnce(&mut Pressure)) {
        let thresholds = self.thresholds;
        self.state.send_modify(|pressure| {
            change(pressure);
            thresholds.reevaluate(pressure);
        });
    }

    /// The demuxer produced `count` more samples.
    pub fn samples_buffered(&self, count: usize) {
        self.update(|pressure| pressure.pending_samples += count);
    }

    /// `count` buffered samples were dropped without being submitted.
    pub fn samples_discarded(&self, count: usize) {
        self.update(|pressure| {
            pressure.pending_samples = pressure.pending_samples.saturating_sub(count);
        });
    }

    /// One buffered sample moved into the decoder queue.
    pub fn sample_submitted(&self) {
        self.update(|pressure| {
            pressure.pending_samples = pressure.pending_samples.saturating_sub(1);
            pressure.decode_queue += 1;
        });
    }

    /// The decoder finished one queued sample.
    pub fn sample_decoded(&self) {
        self.update(|pressure| {
            pressure.decode_queue = pressure.decode_queue.saturating_sub(1);
        });
    }

    /// Wait until the reader may issue its next read.
    pub async fn reading_allowed(&self) {
        let mut receiver = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = receiver.wait_for(|pressure| !pressure.reading_paused).await;
    }

    /// Wait until the decoder queue has room for another sample.
    pub async fn decoder_capacity(&self) {
        let max = self.thresholds.max_decode_queue;
        let mut receiver = self.state.subscribe();
        let _ = receiver.wait_for(|pressure| pressure.decode_queue < max).await;
    }

    /// Wait for a post-decode processing slot.
    ///
    /// The slot is held until the returned [`FrameSlot`] is dropped.
    pub async fn acquire_slot(&self) -> FrameSlot {
        let max = self.thresholds.max_frames_in_flight;
        let mut receiver = self.state.subscribe();
        loop {
            let acquired = self.state.send_if_modified(|pressure| {
                if pressure.frames_in_flight < max {
                    pressure.frames_in_flight += 1;
                    true
                } else {
                    false
                }
            });
            if acquired {
                return FrameSlot {
                    coordinator: self.clone(),
                };
            }
            let _ = receiver
                .wait_for(|pressure| pressure.frames_in_flight < max)
                .await;
        }
    }

    /// Current queue depths.
    pub fn snapshot(&self) -> Pressure {
        *self.state.borrow()
    }
}

/// One unit of the post-decode concurrency cap.
///
/// Dropping the slot admits the next decoded frame.
pub struct FrameSlot {
    coordinator: Coordinator,
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        self.coordinator.update(|pressure| {
            pressure.frames_in_flight = pressure.frames_in_flight.saturating_sub(1);
        });
    }
}
