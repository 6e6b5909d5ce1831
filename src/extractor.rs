//! The public control surface.
//!
//! [`FrameExtractor`] owns a store, a decoder backend and at most one
//! active run. [`start`](FrameExtractor::start) launches a run in the
//! background and returns its [`SessionId`] immediately; progress flows
//! through the configured [`ProgressCallback`] and the shared
//! [`ProcessingState`].
//!
//! State moves `idle → processing → completed | error`, or back to `idle`
//! when the run is cancelled. Starting a new run first cancels the previous
//! one and waits until all of its resources are released.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stillcut::{
//!     DirectoryStore, ExtractionConfig, FrameExtractor, FrameStore, OutputFormat, ProcessingStatus,
//! };
//!
//! # async fn example() -> Result<(), stillcut::ExtractError> {
//! let extractor = FrameExtractor::builder()
//!     .with_store(Arc::new(DirectoryStore::new("frames")))
//!     .with_preview(Arc::new(|frame: &stillcut::ExtractedFrame| {
//!         println!("kept {:.2}s", frame.timestamp_seconds());
//!     }))
//!     .build();
//!
//! let config = ExtractionConfig::new(2.0)
//!     .with_format(OutputFormat::Png)
//!     .with_window(30.0, 90.0);
//! let session = extractor.start("lecture.mp4", config).await?;
//!
//! let state = extractor.wait().await;
//! assert_eq!(state.status, ProcessingStatus::Completed);
//! println!("{} frames", extractor.store().frame_count(&session).await?);
//! # Ok(())
//! # }
//! ```

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    path::Path,
    sync::Arc,
};

use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};

use crate::{
    configuration::{ExtractionConfig, PipelineLimits},
    decoder::{DecoderBackend, FfmpegBackend},
    error::ExtractError,
    pipeline::{self, Job},
    progress::{
        CancellationToken, FramePreview, NoOpProgress, ProcessingState, ProcessingStatus,
        ProgressCallback, ProgressTracker,
    },
    store::{FrameStore, MemoryStore, SessionId},
};

/// Runs extractions one at a time against a shared store.
pub struct FrameExtractor {
    store: Arc<dyn FrameStore>,
    backend: Arc<dyn DecoderBackend>,
    limits: PipelineLimits,
    progress: Arc<dyn ProgressCallback>,
    preview: Option<Arc<dyn FramePreview>>,
    state: Arc<watch::Sender<ProcessingState>>,
    active: Mutex<Option<ActiveRun>>,
}

struct ActiveRun {
    session: SessionId,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ActiveRun {
    /// Cancel the run and wait for its teardown.
    async fn stop(self) {
        self.token.cancel();
        if let Err(error) = self.handle.await {
            log::warn!("Run {} ended abnormally: {error}", self.session);
        }
    }
}

impl FrameExtractor {
    /// Start configuring an extractor.
    pub fn builder() -> FrameExtractorBuilder {
        FrameExtractorBuilder::default()
    }

    /// An extractor writing to `store` with default settings.
    pub fn new(store: Arc<dyn FrameStore>) -> Self {
        Self::builder().with_store(store).build()
    }

    /// Start extracting frames from the video at `path`.
    ///
    /// Any run still active is cancelled and fully torn down first. The
    /// run continues in the background; watch it through the progress
    /// callback, [`state`](Self::state) or [`wait`](Self::wait).
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::InvalidConfig`] if `config` is rejected.
    /// Failures during the run, including an unreadable file, end the run
    /// in [`ProcessingStatus::Error`] instead.
    pub async fn start<P: AsRef<Path>>(
        &self,
        path: P,
        config: ExtractionConfig,
    ) -> Result<SessionId, ExtractError> {
        config.validate()?;

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            log::debug!("Tearing down run {} before starting another", previous.session);
            previous.stop().await;
        }

        let session = SessionId::new();
        let token = CancellationToken::new();
        let path = path.as_ref().to_path_buf();
        log::info!(
            "Extracting {} every {}s as {} into {session}",
            path.display(),
            config.interval,
            config.format
        );

        let job = Job {
            session: session.clone(),
            path,
            config,
            limits: self.limits.clone(),
            store: Arc::clone(&self.store),
            backend: Arc::clone(&self.backend),
            preview: self.preview.clone(),
            token: token.clone(),
        };
        let mut tracker = ProgressTracker::start(
            Arc::clone(&self.progress),
            Arc::clone(&self.state),
            session.clone(),
        );
        let handle = tokio::spawn(async move {
            let session = job.session.clone();
            match pipeline::run(job, &mut tracker).await {
                Ok(()) => {
                    log::info!(
                        "Run {session} completed with {} frames",
                        tracker.processed_frames()
                    );
                    tracker.complete();
                }
                Err(ExtractError::Cancelled) => {
                    log::info!(
                        "Run {session} cancelled after {} frames",
                        tracker.processed_frames()
                    );
                    tracker.cancel();
                }
                Err(error) => {
                    log::error!("Run {session} failed: {error}");
                    tracker.fail(error.to_string());
                }
            }
        });

        *active = Some(ActiveRun {
            session: session.clone(),
            token,
            handle,
        });
        Ok(session)
    }

    /// Cancel the active run, if any, and wait until its decoder and file
    /// handle are released.
    ///
    /// A run that was still processing reports a final
    /// [`ProcessingStatus::Idle`]. Frames it already stored stay in the
    /// store.
    pub async fn cancel(&self) {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            log::debug!("Cancelling run {}", previous.session);
            previous.stop().await;
        }
    }

    /// Snapshot of the current processing state.
    pub fn state(&self) -> ProcessingState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ProcessingState> {
        self.state.subscribe()
    }

    /// Wait until no run is processing and return the resulting state.
    pub async fn wait(&self) -> ProcessingState {
        let mut receiver = self.state.subscribe();
        match receiver
            .wait_for(|state| state.status != ProcessingStatus::Processing)
            .await
        {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    /// The store runs write to.
    pub fn store(&self) -> &Arc<dyn FrameStore> {
        &self.store
    }

    /// Limits applied to every run.
    pub fn limits(&self) -> &PipelineLimits {
        &self.limits
    }
}

impl Drop for FrameExtractor {
    fn drop(&mut self) {
        // The run tears itself down once it observes the token.
        if let Some(active) = self.active.get_mut().take() {
            active.token.cancel();
        }
    }
}

impl Debug for FrameExtractor {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("FrameExtractor")
            .field("backend", &self.backend.name())
            .field("limits", &self.limits)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

/// Builder for [`FrameExtractor`].
///
/// Defaults: a [`MemoryStore`], the [`FfmpegBackend`], default
/// [`PipelineLimits`], no progress callback and no preview.
#[derive(Default)]
#[must_use]
pub struct FrameExtractorBuilder {
    store: Option<Arc<dyn FrameStore>>,
    backend: Option<Arc<dyn DecoderBackend>>,
    limits: PipelineLimits,
    progress: Option<Arc<dyn ProgressCallback>>,
    preview: Option<Arc<dyn FramePreview>>,
}

impl FrameExtractorBuilder {
    /// Store kept frames in `store`.
    pub fn with_store(mut self, store: Arc<dyn FrameStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Decode with `backend`.
    pub fn with_backend(mut self, backend: Arc<dyn DecoderBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Override queue sizes and watermarks.
    pub fn with_limits(mut self, limits: PipelineLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Report progress to `callback`.
    pub fn with_progress(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Hand each stored frame to `preview`.
    pub fn with_preview(mut self, preview: Arc<dyn FramePreview>) -> Self {
        self.preview = Some(preview);
        self
    }

    /// Build the extractor.
    pub fn build(self) -> FrameExtractor {
        let (state, _) = watch::channel(ProcessingState::default());
        FrameExtractor {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryStore::new())),
            backend: self
                .backend
                .unwrap_or_else(|| Arc::new(FfmpegBackend::new())),
            limits: self.limits,
            progress: self.progress.unwrap_or_else(|| Arc::new(NoOpProgress)),
            preview: self.preview,
            state: Arc::new(state),
            active: Mutex::new(None),
        }
    }
}
