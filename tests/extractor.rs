//! End-to-end extraction runs over synthetic videos.
//!
//! These use a fake decoder backend, so they need neither fixtures nor a
//! working FFmpeg install.

mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use common::{FakeBackend, FlakyStore, SyntheticVideo, seconds};
use stillcut::{
    DirectoryStore, ExtractError, ExtractedFrame, ExtractionConfig, FrameExtractor, FrameStore,
    MemoryStore, OutputFormat, PipelineLimits, ProcessingState, ProcessingStatus, ProgressInfo,
};
use tokio::time::timeout;

const RUN_TIMEOUT: Duration = Duration::from_secs(30);

fn extractor(store: Arc<dyn FrameStore>, backend: Arc<FakeBackend>) -> FrameExtractor {
    FrameExtractor::builder()
        .with_store(store)
        .with_backend(backend)
        .build()
}

async fn finish(extractor: &FrameExtractor) -> ProcessingState {
    timeout(RUN_TIMEOUT, extractor.wait())
        .await
        .expect("Run did not finish in time")
}

/// Wait until the run has stored at least `frames` frames.
async fn stored_at_least(extractor: &FrameExtractor, frames: u64) {
    let mut receiver = extractor.subscribe();
    timeout(
        RUN_TIMEOUT,
        receiver.wait_for(|state| state.processed_frames >= frames),
    )
    .await
    .expect("Run stored too few frames in time")
    .expect("State channel closed");
}

// ── completion ─────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keeps_one_frame_per_interval_over_the_whole_video() {
    let directory = tempfile::tempdir().expect("Failed to create temp dir");
    let path = SyntheticVideo::spanning(30, 10).write_to(directory.path(), "video.mp4");
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(FakeBackend::new());
    let extractor = extractor(store.clone(), backend.clone());

    let session = extractor
        .start(&path, ExtractionConfig::new(5.0))
        .await
        .expect("Failed to start");
    let state = finish(&extractor).await;

    assert_eq!(state.status, ProcessingStatus::Completed, "{:?}", state.error);
    assert_eq!(state.session_id.as_ref(), Some(&session));
    assert_eq!(state.total_frames, 7);
    assert_eq!(state.processed_frames, 7);

    let frames = store.get_by_session(&session).await.expect("Failed to list");
    assert_eq!(seconds(&frames), vec![0.0, 5.0, 10.0, 15.0, 20.0, 25.0, 30.0]);
    assert!(frames.iter().all(|frame| frame.format == OutputFormat::Jpeg));
    assert!(frames.iter().all(|frame| frame.data.starts_with(&[0xFF, 0xD8])));
    assert!(frames.iter().all(|frame| frame.session_id == session));

    assert_eq!(backend.opens(), 1);
    assert_eq!(backend.releases(), 1);
    assert_eq!(backend.decoded(), 301);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn window_end_stops_the_run_early() {
    let directory = tempfile::tempdir().expect("Failed to create temp dir");
    let path = SyntheticVideo::spanning(30, 10).write_to(directory.path(), "video.mp4");
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(FakeBackend::new());
    let extractor = extractor(store.clone(), backend.clone());

    let config = ExtractionConfig::new(1.0)
        .with_format(OutputFormat::Png)
        .with_window(10.0, 12.0);
    let session = extractor.start(&path, config).await.expect("Failed to start");
    let state = finish(&extractor).await;

    assert_eq!(state.status, ProcessingStatus::Completed, "{:?}", state.error);
    assert_eq!(state.total_frames, 3);
    assert_eq!(state.processed_frames, 3);

    let frames = store.get_by_session(&session).await.expect("Failed to list");
    assert_eq!(seconds(&frames), vec![10.0, 11.0, 12.0]);
    assert!(frames.iter().all(|frame| frame.mime_type() == "image/png"));
    assert_eq!(backend.releases(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn media_before_movie_extracts_the_same_frames() {
    let directory = tempfile::tempdir().expect("Failed to create temp dir");
    let video = SyntheticVideo {
        media_first: true,
        ..SyntheticVideo::spanning(10, 10)
    };
    let path = video.write_to(directory.path(), "video.mp4");
    let store = Arc::new(MemoryStore::new());
    let extractor = extractor(store.clone(), Arc::new(FakeBackend::new()));

    let session = extractor
        .start(&path, ExtractionConfig::new(2.5))
        .await
        .expect("Failed to start");
    let state = finish(&extractor).await;

    assert_eq!(state.status, ProcessingStatus::Completed, "{:?}", state.error);
    let frames = store.get_by_session(&session).await.expect("Failed to list");
    assert_eq!(seconds(&frames), vec![0.0, 2.5, 5.0, 7.5, 10.0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tight_limits_still_extract_everything() {
    let directory = tempfile::tempdir().expect("Failed to create temp dir");
    let video = SyntheticVideo {
        sample_size: 700,
        ..SyntheticVideo::spanning(20, 10)
    };
    let path = video.write_to(directory.path(), "video.mp4");
    let store = Arc::new(MemoryStore::new());
    let limits = PipelineLimits::default()
        .with_chunk_size(1000)
        .with_samples_per_batch(3)
        .with_watermarks(2, 6)
        .with_max_decode_queue(2)
        .with_max_frames_in_flight(1);
    let extractor = FrameExtractor::builder()
        .with_store(store.clone())
        .with_backend(Arc::new(FakeBackend::new()))
        .with_limits(limits)
        .build();

    let session = extractor
        .start(&path, ExtractionConfig::new(4.0))
        .await
        .expect("Failed to start");
    let state = finish(&extractor).await;

    assert_eq!(state.status, ProcessingStatus::Completed, "{:?}", state.error);
    let frames = store.get_by_session(&session).await.expect("Failed to list");
    assert_eq!(seconds(&frames), vec![0.0, 4.0, 8.0, 12.0, 16.0, 20.0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frames_are_previewed_in_timestamp_order() {
    let directory = tempfile::tempdir().expect("Failed to create temp dir");
    let path = SyntheticVideo::spanning(20, 10).write_to(directory.path(), "video.mp4");
    let previewed = Arc::new(Mutex::new(Vec::new()));
    let progress = Arc::new(Mutex::new(Vec::<ProgressInfo>::new()));

    let extractor = {
        let previewed = Arc::clone(&previewed);
        let progress = Arc::clone(&progress);
        FrameExtractor::builder()
            .with_backend(Arc::new(FakeBackend::new()))
            .with_limits(PipelineLimits::default().with_max_frames_in_flight(4))
            .with_preview(Arc::new(move |frame: &ExtractedFrame| {
                previewed.lock().unwrap().push(frame.timestamp);
            }))
            .with_progress(Arc::new(move |info: &ProgressInfo| {
                progress.lock().unwrap().push(info.clone());
            }))
            .build()
    };

    let session = extractor
        .start(&path, ExtractionConfig::new(1.0))
        .await
        .expect("Failed to start");
    let state = finish(&extractor).await;
    assert_eq!(state.status, ProcessingStatus::Completed, "{:?}", state.error);

    let previewed = previewed.lock().unwrap().clone();
    let stored: Vec<i64> = extractor
        .store()
        .get_by_session(&session)
        .await
        .expect("Failed to list")
        .iter()
        .map(|frame| frame.timestamp)
        .collect();
    assert_eq!(previewed.len(), 21);
    assert_eq!(previewed, stored);
    assert!(previewed.windows(2).all(|pair| pair[0] < pair[1]));

    let progress = progress.lock().unwrap().clone();
    assert_eq!(progress.first().map(|info| info.status), Some(ProcessingStatus::Processing));
    assert_eq!(progress.last().map(|info| info.status), Some(ProcessingStatus::Completed));
    let counts: Vec<u64> = progress.iter().map(|info| info.processed_frames).collect();
    assert!(counts.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(progress.last().and_then(|info| info.percentage()), Some(100.0));
}

// ── cancellation ───────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_releases_the_decoder_and_returns_to_idle() {
    let directory = tempfile::tempdir().expect("Failed to create temp dir");
    let path = SyntheticVideo::spanning(30, 10).write_to(directory.path(), "video.mp4");
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(FakeBackend::new().with_delay(Duration::from_millis(10)));
    let extractor = extractor(store.clone(), backend.clone());

    let session = extractor
        .start(&path, ExtractionConfig::new(1.0))
        .await
        .expect("Failed to start");
    stored_at_least(&extractor, 1).await;

    timeout(RUN_TIMEOUT, extractor.cancel())
        .await
        .expect("Cancel did not finish in time");

    let state = extractor.state();
    assert_eq!(state.status, ProcessingStatus::Idle);
    assert_eq!(state.error, None);
    assert_eq!(backend.opens(), 1);
    assert_eq!(backend.releases(), 1);
    assert!(backend.decoded() < 301, "decoded every sample despite cancel");

    // Frames stored before the cancel stay.
    let kept = store.frame_count(&session).await.expect("Failed to count");
    assert!(kept >= 1);
    assert!(kept as u64 >= state.processed_frames);

    // Nothing runs on after the cancel.
    let decoded = backend.decoded();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.decoded(), decoded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_without_a_run_is_a_no_op() {
    let extractor = FrameExtractor::builder()
        .with_backend(Arc::new(FakeBackend::new()))
        .build();
    extractor.cancel().await;
    assert_eq!(extractor.state().status, ProcessingStatus::Idle);
    assert_eq!(extractor.state().session_id, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn starting_again_tears_down_the_previous_run() {
    let directory = tempfile::tempdir().expect("Failed to create temp dir");
    let long = SyntheticVideo::spanning(30, 10).write_to(directory.path(), "long.mp4");
    let short = SyntheticVideo::spanning(4, 10).write_to(directory.path(), "short.mp4");
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(FakeBackend::new().with_delay(Duration::from_millis(5)));
    let extractor = extractor(store.clone(), backend.clone());

    let first = extractor
        .start(&long, ExtractionConfig::new(1.0))
        .await
        .expect("Failed to start first run");
    stored_at_least(&extractor, 1).await;

    let second = extractor
        .start(&short, ExtractionConfig::new(2.0))
        .await
        .expect("Failed to start second run");
    assert_ne!(first, second);
    // The first decoder is gone before the second run starts.
    assert!(backend.releases() >= 1);

    let state = finish(&extractor).await;
    assert_eq!(state.status, ProcessingStatus::Completed, "{:?}", state.error);
    assert_eq!(state.session_id.as_ref(), Some(&second));
    assert_eq!(state.processed_frames, 3);
    assert_eq!(backend.opens(), 2);
    assert_eq!(backend.releases(), 2);

    let second_frames = store.get_by_session(&second).await.expect("Failed to list");
    assert_eq!(seconds(&second_frames), vec![0.0, 2.0, 4.0]);
    assert!(store.frame_count(&first).await.expect("Failed to count") >= 1);
}

// ── failures ───────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn storage_failures_skip_frames_without_ending_the_run() {
    let directory = tempfile::tempdir().expect("Failed to create temp dir");
    let path = SyntheticVideo::spanning(30, 10).write_to(directory.path(), "video.mp4");
    let store = Arc::new(FlakyStore::new(2));
    let extractor = extractor(store.clone(), Arc::new(FakeBackend::new()));

    let session = extractor
        .start(&path, ExtractionConfig::new(5.0))
        .await
        .expect("Failed to start");
    let state = finish(&extractor).await;

    assert_eq!(state.status, ProcessingStatus::Completed, "{:?}", state.error);
    assert_eq!(store.attempts(), 7);
    assert_eq!(store.rejected(), vec![5_000_000, 15_000_000, 25_000_000]);

    let frames = store.get_by_session(&session).await.expect("Failed to list");
    assert_eq!(seconds(&frames), vec![0.0, 10.0, 20.0, 30.0]);
    // Only stored frames count as processed.
    assert_eq!(state.processed_frames, 4);
    assert_eq!(state.total_frames, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn decoder_failure_ends_the_run_with_an_error() {
    let directory = tempfile::tempdir().expect("Failed to create temp dir");
    let path = SyntheticVideo::spanning(10, 10).write_to(directory.path(), "video.mp4");
    let backend = Arc::new(FakeBackend::failing_at(42));
    let extractor = extractor(Arc::new(MemoryStore::new()), backend.clone());

    extractor
        .start(&path, ExtractionConfig::new(1.0))
        .await
        .expect("Failed to start");
    let state = finish(&extractor).await;

    assert_eq!(state.status, ProcessingStatus::Error);
    let message = state.error.expect("No error message");
    assert!(message.contains("corrupt sample 42"), "{message}");
    assert_eq!(backend.releases(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn audio_only_file_reports_no_video_track() {
    let directory = tempfile::tempdir().expect("Failed to create temp dir");
    let video = SyntheticVideo {
        handler: *b"soun",
        ..SyntheticVideo::default()
    };
    let path = video.write_to(directory.path(), "audio.mp4");
    let backend = Arc::new(FakeBackend::new());
    let extractor = extractor(Arc::new(MemoryStore::new()), backend.clone());

    extractor
        .start(&path, ExtractionConfig::new(1.0))
        .await
        .expect("Failed to start");
    let state = finish(&extractor).await;

    assert_eq!(state.status, ProcessingStatus::Error);
    assert_eq!(
        state.error.as_deref(),
        Some(ExtractError::NoVideoTrack.to_string().as_str())
    );
    assert_eq!(backend.opens(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_file_reports_a_read_error() {
    let directory = tempfile::tempdir().expect("Failed to create temp dir");
    let extractor = extractor(Arc::new(MemoryStore::new()), Arc::new(FakeBackend::new()));

    extractor
        .start(directory.path().join("missing.mp4"), ExtractionConfig::new(1.0))
        .await
        .expect("Failed to start");
    let state = finish(&extractor).await;

    assert_eq!(state.status, ProcessingStatus::Error);
    let message = state.error.expect("No error message");
    assert!(message.contains("Failed to read source file"), "{message}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_config_is_rejected_before_starting() {
    let extractor = FrameExtractor::builder()
        .with_backend(Arc::new(FakeBackend::new()))
        .build();

    let result = extractor.start("video.mp4", ExtractionConfig::new(0.0)).await;
    assert!(matches!(result, Err(ExtractError::InvalidConfig(_))));
    assert_eq!(extractor.state().status, ProcessingStatus::Idle);
}

// ── stores ─────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn directory_store_receives_every_kept_frame() {
    let directory = tempfile::tempdir().expect("Failed to create temp dir");
    let path = SyntheticVideo::spanning(6, 10).write_to(directory.path(), "video.mp4");
    let store = Arc::new(DirectoryStore::new(directory.path().join("frames")));
    let extractor = extractor(store.clone(), Arc::new(FakeBackend::new()));

    let config = ExtractionConfig::new(3.0).with_format(OutputFormat::WebP);
    let session = extractor.start(&path, config).await.expect("Failed to start");
    let state = finish(&extractor).await;
    assert_eq!(state.status, ProcessingStatus::Completed, "{:?}", state.error);

    let frames = store.get_by_session(&session).await.expect("Failed to list");
    assert_eq!(seconds(&frames), vec![0.0, 3.0, 6.0]);
    assert!(frames.iter().all(|frame| frame.format == OutputFormat::WebP));
    assert!(store.session_dir(&session).is_dir());
}
