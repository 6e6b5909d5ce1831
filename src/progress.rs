//! Progress reporting, live preview, and cancellation.
//!
//! This module provides [`ProgressCallback`] for monitoring a run,
//! [`FramePreview`] for receiving each kept frame as it is stored,
//! [`CancellationToken`] for cooperative cancellation, and the
//! [`ProcessingState`] record that [`FrameExtractor`](crate::FrameExtractor)
//! exposes.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stillcut::{
//!     ExtractionConfig, FrameExtractor, MemoryStore, ProgressCallback, ProgressInfo,
//! };
//!
//! struct PrintProgress;
//!
//! impl ProgressCallback for PrintProgress {
//!     fn on_progress(&self, info: &ProgressInfo) {
//!         match info.percentage() {
//!             Some(pct) => println!("[{}] {pct:.1}% complete", info.status),
//!             None => println!("[{}] {} frames", info.status, info.processed_frames),
//!         }
//!     }
//! }
//!
//! # async fn example() -> Result<(), stillcut::ExtractError> {
//! let extractor = FrameExtractor::builder()
//!     .with_store(Arc::new(MemoryStore::new()))
//!     .with_progress(Arc::new(PrintProgress))
//!     .build();
//! extractor.start("input.mp4", ExtractionConfig::new(5.0)).await?;
//! extractor.wait().await;
//! # Ok(())
//! # }
//! ```

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::sync::{Notify, watch};

use crate::store::{ExtractedFrame, SessionId};

/// Lifecycle of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProcessingStatus {
    /// No run is active. Also the state after a cancel.
    #[default]
    Idle,
    /// A run is in progress.
    Processing,
    /// The last run reached the end of the video or its time window.
    Completed,
    /// The last run stopped on a fatal error.
    Error,
}

impl ProcessingStatus {
    /// Whether a run in this state has ended.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProcessingStatus::Processing)
    }
}

impl Display for ProcessingStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(match self {
            ProcessingStatus::Idle => "idle",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Error => "error",
        })
    }
}

/// The controller's state record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingState {
    /// Session of the current or last run.
    pub session_id: Option<SessionId>,
    /// Frames kept and handed to the store.
    pub processed_frames: u64,
    /// Estimated number of frames the run will keep. Zero when unknown.
    pub total_frames: u64,
    /// Where the controller is in its lifecycle.
    pub status: ProcessingStatus,
    /// Message of the fatal error, when `status` is
    /// [`ProcessingStatus::Error`].
    pub error: Option<String>,
}

/// A progress snapshot delivered to [`ProgressCallback::on_progress`].
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Session the event belongs to.
    pub session_id: Option<SessionId>,
    /// Frames kept so far.
    pub processed_frames: u64,
    /// Estimated total frames to keep. Zero when unknown.
    pub total_frames: u64,
    /// Current status.
    pub status: ProcessingStatus,
    /// Error message, on failure.
    pub error: Option<String>,
    /// Wall-clock time since the run started.
    pub elapsed: Duration,
}

impl ProgressInfo {
    /// Completion percentage (0.0 – 100.0), if the total is known.
    ///
    /// The total is an estimate, so the value is clamped to 100.
    pub fn percentage(&self) -> Option<f32> {
        (self.total_frames > 0).then(|| {
            ((self.processed_frames as f32 / self.total_frames as f32) * 100.0).min(100.0)
        })
    }
}

/// Trait for receiving progress updates.
///
/// Called after every state-relevant event: track found, each kept frame,
/// completion, error, and cancel. Implementations must be [`Send`] and
/// [`Sync`]; calls happen on the runtime's worker threads.
///
/// Progress callbacks are **infallible**: they observe but cannot halt the
/// run. Use [`FrameExtractor::cancel`](crate::FrameExtractor::cancel) for
/// that.
pub trait ProgressCallback: Send + Sync {
    /// Called with each new progress snapshot.
    fn on_progress(&self, info: &ProgressInfo);
}

impl<F> ProgressCallback for F
where
    F: Fn(&ProgressInfo) + Send + Sync,
{
    fn on_progress(&self, info: &ProgressInfo) {
        self(info)
    }
}

/// A no-op implementation that discards all progress notifications.
pub(crate) struct NoOpProgress;

impl ProgressCallback for NoOpProgress {
    fn on_progress(&self, _info: &ProgressInfo) {}
}

/// Trait for receiving each kept frame once it is stored.
///
/// Frames arrive in timestamp order.
pub trait FramePreview: Send + Sync {
    /// Called with a frame that was just persisted.
    fn on_frame(&self, frame: &ExtractedFrame);
}

impl<F> FramePreview for F
where
    F: Fn(&ExtractedFrame) + Send + Sync,
{
    fn on_frame(&self, frame: &ExtractedFrame) {
        self(frame)
    }
}

/// Cooperative cancellation token.
///
/// Clone this token and share it between tasks; call
/// [`cancel`](CancellationToken::cancel) from anywhere to stop the run it
/// belongs to. Stages poll [`is_cancelled`](CancellationToken::is_cancelled)
/// between units of work and await [`cancelled`](CancellationToken::cancelled)
/// while idle.
///
/// # Example
///
/// ```
/// use stillcut::CancellationToken;
///
/// let token = CancellationToken::new();
/// assert!(!token.is_cancelled());
///
/// token.clone().cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    /// Create a new, non-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    ///
    /// All clones of this token observe the cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Tracks one run's counters and publishes every change.
///
/// Owned by the run's reporting loop, which makes it the only writer of the
/// shared [`ProcessingState`] while the run is active.
pub(crate) struct ProgressTracker {
    callback: Arc<dyn ProgressCallback>,
    state: Arc<watch::Sender<ProcessingState>>,
    start_time: Instant,
    current: ProcessingState,
}

impl ProgressTracker {
    /// Start tracking a run and publish its `processing` state.
    pub(crate) fn start(
        callback: Arc<dyn ProgressCallback>,
        state: Arc<watch::Sender<ProcessingState>>,
        session_id: SessionId,
    ) -> Self {
        let mut tracker = Self {
            callback,
            state,
            start_time: Instant::now(),
            current: ProcessingState {
                session_id: Some(session_id),
                processed_frames: 0,
                total_frames: 0,
                status: ProcessingStatus::Processing,
                error: None,
            },
        };
        tracker.report();
        tracker
    }

    pub(crate) fn processed_frames(&self) -> u64 {
        self.current.processed_frames
    }

    /// The track was found and the kept-frame estimate is known.
    pub(crate) fn set_total(&mut self, total_frames: u64) {
        self.current.total_frames = total_frames;
        self.report();
    }

    /// One more frame was kept.
    pub(crate) fn frame_kept(&mut self) {
        self.current.processed_frames += 1;
        self.report();
    }

    pub(crate) fn complete(&mut self) {
        self.current.status = ProcessingStatus::Completed;
        self.report();
    }

    /// Record a fatal error. The frame count keeps its value.
    pub(crate) fn fail(&mut self, message: String) {
        self.current.status = ProcessingStatus::Error;
        self.current.error = Some(message);
        self.report();
    }

    pub(crate) fn cancel(&mut self) {
        self.current.status = ProcessingStatus::Idle;
        self.report();
    }

    fn report(&mut self) {
        let current = self.current.clone();
        self.state.send_replace(current.clone());
        self.callback.on_progress(&ProgressInfo {
            session_id: current.session_id,
            processed_frames: current.processed_frames,
            total_frames: current.total_frames,
            status: current.status,
            error: current.error,
            elapsed: self.start_time.elapsed(),
        });
    }
}
